pub mod collaborators;
pub mod config;
pub mod diff_queue;
pub mod entity_store;
pub mod http;
pub mod logging;
pub mod notify;
pub mod push;
pub mod search;
