pub mod aggregate;
pub mod album;
pub mod card;
pub mod chat;
pub mod chat_message;
pub mod clients;
pub mod comment;
pub mod diff;
pub mod dispatch;
pub mod error;
pub mod flag;
pub mod follow;
pub mod gc;
pub mod ports;
pub mod post;
pub mod record;
pub mod store;
pub mod stream;
pub mod transaction;
pub mod user;
pub mod util;
pub mod views;
pub mod wiring;

pub type DomainResult<T> = Result<T, error::DomainError>;
