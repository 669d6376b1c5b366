pub mod backoff;
pub mod connection;
pub mod dispatcher;
pub mod mailbox;
pub mod messenger;
pub mod poller;

pub use backoff::BackoffPolicy;
pub use connection::{
    ClientError, ConnectionManager, ConnectionOptions, LinkState, TransportError,
};
pub use mailbox::{Mailbox, MailboxClosed, MailboxSender};
pub use messenger::{Event, Messenger, MessengerError, MessengerOptions};

use tokio::sync::watch;

/// Resolve once the shutdown flag is raised (or its sender is gone, which
/// counts the same). Safe to poll repeatedly from `select!` loops.
pub(crate) async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
