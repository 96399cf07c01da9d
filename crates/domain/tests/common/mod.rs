#![allow(dead_code)]

use std::sync::Arc;

use ripple_domain::clients::InMemoryClients;
use ripple_domain::diff::RecordDiff;
use ripple_domain::ports::store::{EntityStore, ReadConsistency};
use ripple_domain::record::{EntityKind, ItemKey, Record};
use ripple_domain::store::InMemoryEntityStore;
use ripple_domain::wiring::{Collaborators, CoreServices, CoreSettings};
use tokio::sync::mpsc::UnboundedReceiver;

pub struct Harness {
    pub core: CoreServices,
    pub clients: InMemoryClients,
    pub store: Arc<dyn EntityStore>,
    stream: UnboundedReceiver<RecordDiff>,
}

impl Harness {
    pub fn new() -> Self {
        let (store, stream) = InMemoryEntityStore::with_stream();
        let store: Arc<dyn EntityStore> = Arc::new(store);
        let clients = InMemoryClients::new();
        let collaborators = Collaborators {
            search: Arc::new(clients.clone()),
            push: Arc::new(clients.clone()),
            notifier: Arc::new(clients.clone()),
        };
        let core = CoreServices::new(store.clone(), collaborators, CoreSettings::default());
        Self {
            core,
            clients,
            store,
            stream,
        }
    }

    /// Routes every pending diff, including those produced while routing, and returns
    /// them in delivery order.
    pub async fn settle(&mut self) -> Vec<RecordDiff> {
        let mut delivered = Vec::new();
        while let Ok(diff) = self.stream.try_recv() {
            self.core.router.route(&diff).await.unwrap();
            delivered.push(diff);
        }
        delivered
    }

    /// Drains pending diffs without routing them, so a test can deliver them out of order.
    pub fn take_pending(&mut self) -> Vec<RecordDiff> {
        let mut pending = Vec::new();
        while let Ok(diff) = self.stream.try_recv() {
            pending.push(diff);
        }
        pending
    }

    /// Delivers `diffs` again, then settles whatever they cause.
    pub async fn redeliver(&mut self, diffs: &[RecordDiff]) {
        for diff in diffs {
            self.core.router.route(diff).await.unwrap();
        }
        self.settle().await;
    }

    pub async fn add_user(&mut self, user_id: &str, username: &str) {
        let record = Record::new(&ItemKey::root(EntityKind::User, user_id))
            .with("userId", user_id)
            .with("username", username);
        self.store.put(&record, None).await.unwrap();
        self.settle().await;
    }

    pub async fn get(&self, key: &ItemKey) -> Option<Record> {
        self.store.get(key, ReadConsistency::Strong).await.unwrap()
    }

    pub async fn root(&self, kind: EntityKind, id: &str) -> Record {
        self.get(&ItemKey::root(kind, id))
            .await
            .unwrap_or_else(|| panic!("{kind} `{id}` missing"))
    }

    pub async fn count(&self, kind: EntityKind, id: &str, attr: &str) -> i64 {
        self.root(kind, id).await.count(attr)
    }
}
