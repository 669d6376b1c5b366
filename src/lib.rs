pub mod auth;
pub mod cli;
pub mod messages;
pub mod network;
pub mod storage;

// Re-export key types for easy testing
pub use messages::{DeliveryStatus, IncomingMessage, Request, Response};
pub use network::{Event, LinkState, Messenger, MessengerOptions};
pub use storage::{Database, OutboxEntry, OutboxStatus};
