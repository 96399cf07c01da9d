use std::sync::Arc;

use crate::aggregate::AggregateWriter;
use crate::album::AlbumService;
use crate::card::{CardPostProcessor, CardService};
use crate::chat::{ChatPostProcessor, ChatService};
use crate::chat_message::{ChatMessagePostProcessor, ChatMessageService};
use crate::comment::{CommentPostProcessor, CommentService};
use crate::dispatch::DiffRouter;
use crate::flag::{FlagCounter, FlagPolicy, FlagService};
use crate::follow::FollowPostProcessor;
use crate::gc::GarbageCollector;
use crate::ports::clients::{Notifier, PushEndpoints, SearchIndex};
use crate::ports::store::EntityStore;
use crate::post::{PostPostProcessor, PostService};
use crate::record::EntityKind;
use crate::transaction::TransactionCoordinator;
use crate::user::UserPostProcessor;

const DEFAULT_GC_PAGE_SIZE: usize = 100;

/// External collaborators the core talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub search: Arc<dyn SearchIndex>,
    pub push: Arc<dyn PushEndpoints>,
    pub notifier: Arc<dyn Notifier>,
}

#[derive(Clone, Debug)]
pub struct CoreSettings {
    pub gc_page_size: usize,
    pub flag_policy: FlagPolicy,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            gc_page_size: DEFAULT_GC_PAGE_SIZE,
            flag_policy: FlagPolicy::default(),
        }
    }
}

/// Every manager and the diff router, built leaf-first over one store.
#[derive(Clone)]
pub struct CoreServices {
    pub store: Arc<dyn EntityStore>,
    pub transactions: TransactionCoordinator,
    pub router: DiffRouter,
    pub albums: AlbumService,
    pub cards: CardService,
    pub chats: ChatService,
    pub chat_messages: ChatMessageService,
    pub comments: CommentService,
    pub flags: FlagService,
    pub posts: PostService,
    pub gc: GarbageCollector,
}

impl CoreServices {
    pub fn new(
        store: Arc<dyn EntityStore>,
        collaborators: Collaborators,
        settings: CoreSettings,
    ) -> Self {
        let transactions = TransactionCoordinator::new(store.clone());
        let writer = AggregateWriter::new(store.clone());
        let cards = CardService::new(store.clone());
        let flags = FlagCounter::new(writer.clone(), settings.flag_policy.clone());

        let follow = Arc::new(FollowPostProcessor::new(writer.clone()));
        let post_processor = Arc::new(PostPostProcessor::new(
            writer.clone(),
            cards.clone(),
            flags.clone(),
        ));
        let chat_processor = Arc::new(ChatPostProcessor::new(
            writer.clone(),
            collaborators.notifier.clone(),
        ));

        let router = DiffRouter::new()
            .register(
                EntityKind::User,
                Arc::new(UserPostProcessor::new(
                    collaborators.search.clone(),
                    collaborators.push.clone(),
                    cards.clone(),
                    follow,
                )),
            )
            .register(EntityKind::Post, post_processor.clone())
            .register(
                EntityKind::Comment,
                Arc::new(CommentPostProcessor::new(
                    writer.clone(),
                    post_processor,
                    flags.clone(),
                )),
            )
            .register(EntityKind::Chat, chat_processor.clone())
            .register(
                EntityKind::ChatMessage,
                Arc::new(ChatMessagePostProcessor::new(chat_processor, flags)),
            )
            .register(
                EntityKind::Card,
                Arc::new(CardPostProcessor::new(
                    writer.clone(),
                    collaborators.notifier.clone(),
                )),
            );

        let chat_messages = ChatMessageService::new(store.clone(), transactions.clone());
        Self {
            albums: AlbumService::new(store.clone(), transactions.clone()),
            chats: ChatService::new(
                store.clone(),
                transactions.clone(),
                writer,
                chat_messages.clone(),
            ),
            chat_messages,
            comments: CommentService::new(store.clone(), transactions.clone()),
            flags: FlagService::new(store.clone(), transactions.clone()),
            posts: PostService::new(store.clone()),
            gc: GarbageCollector::new(store.clone(), settings.gc_page_size),
            cards,
            router,
            transactions,
            store,
        }
    }
}
