use crate::auth;
use crate::messages::{DeliveryStatus, IncomingMessage, OutgoingMessage};
use crate::network::backoff::BackoffPolicy;
use crate::network::connection::{ConnectionManager, ConnectionOptions, LinkState};
use crate::network::dispatcher::OutgoingDispatcher;
use crate::network::mailbox::{Mailbox, MailboxSender};
use crate::network::poller::{DedupeWindow, InboundPoller};
use crate::storage::models::OutboxEntry;
use crate::storage::{Database, StorageError};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// How many inbound message keys the duplicate filter remembers.
const DEDUPE_WINDOW: usize = 256;

/// Notifications flowing from the workers to the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A new message arrived, in server-delivery order.
    Received(IncomingMessage),
    /// An outgoing message reached a reportable state: `Confirmed` once the
    /// server acknowledged it, or `Failed` (exactly once) when its retry
    /// budget ran out.
    Delivery {
        outbox_id: i64,
        recipient: String,
        status: DeliveryStatus,
        attempts: u32,
    },
}

#[derive(Debug, Error)]
pub enum MessengerError {
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error("invalid recipient name {0:?}")]
    InvalidRecipient(String),

    #[error("refusing to queue an empty message")]
    EmptyMessage,

    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("messenger is shut down")]
    Closed,
}

/// Everything the messaging subsystem needs from configuration, already
/// parsed and validated.
#[derive(Debug, Clone)]
pub struct MessengerOptions {
    /// `host:port` of the message server.
    pub server_addr: String,
    pub username: String,
    pub password: String,
    pub poll_interval: Duration,
    /// Per-message delivery attempts before the terminal `failed` state.
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Capacity of each hand-off queue.
    pub queue_capacity: usize,
}

impl MessengerOptions {
    pub fn new(
        server_addr: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            server_addr: server_addr.into(),
            username: username.into(),
            password: password.into(),
            poll_interval: Duration::from_secs(2),
            max_retries: 5,
            backoff: BackoffPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(10),
            queue_capacity: 64,
        }
    }
}

/// The messaging subsystem facade.
///
/// Owns the connection manager and both worker tasks; the presentation
/// layer drives it exclusively through `send`, the event queue, and the
/// connection-state watch, so it never blocks on network I/O itself.
pub struct Messenger {
    conn: Arc<ConnectionManager>,
    db: Arc<Database>,
    outbound: MailboxSender<OutgoingMessage>,
    events: Arc<Mailbox<Event>>,
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    user_id: i64,
    username: String,
}

impl Messenger {
    /// Bring the subsystem up: resolve the local account, replay the
    /// durable outbox into the intake queue (oldest first), then start the
    /// dispatcher and poller. Does not wait for a connection; the workers
    /// establish one in the background.
    pub async fn start(options: MessengerOptions, db: Arc<Database>) -> Result<Self, MessengerError> {
        let user = db.get_or_create_user(
            &options.username,
            &options.password,
            Some(&options.server_addr),
        )?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let conn = Arc::new(ConnectionManager::new(
            ConnectionOptions {
                addr: options.server_addr.clone(),
                username: options.username.clone(),
                password: options.password.clone(),
                backoff: options.backoff,
                connect_timeout: options.connect_timeout,
                read_timeout: options.read_timeout,
            },
            shutdown_rx.clone(),
        ));

        // Size the intake queue so the whole replay fits: queued-before-crash
        // messages must be in the queue before normal operation begins.
        let pending = db.outbox_list_pending(user.user_id)?;
        let outbound = Arc::new(Mailbox::new(options.queue_capacity.max(pending.len())));
        let events = Arc::new(Mailbox::new(options.queue_capacity));
        let outbound_tx = outbound.sender();
        if !pending.is_empty() {
            info!(count = pending.len(), "replaying durable outbox");
        }
        for entry in pending {
            let message = OutgoingMessage {
                outbox_id: entry.outbox_id,
                recipient: entry.recipient,
                body: entry.body,
                timestamp: entry.timestamp,
            };
            outbound_tx
                .send(message)
                .await
                .map_err(|_| MessengerError::Closed)?;
        }

        let dispatcher = OutgoingDispatcher {
            conn: Arc::clone(&conn),
            db: Arc::clone(&db),
            user_id: user.user_id,
            username: options.username.clone(),
            outbound: Arc::clone(&outbound),
            events: events.sender(),
            max_retries: options.max_retries,
            retry_pause: options.backoff.base,
            shutdown: shutdown_rx.clone(),
        };
        let poller = InboundPoller {
            conn: Arc::clone(&conn),
            db: Arc::clone(&db),
            user_id: user.user_id,
            username: options.username.clone(),
            events: events.sender(),
            interval: options.poll_interval,
            shutdown: shutdown_rx,
            seen: DedupeWindow::new(DEDUPE_WINDOW),
        };
        let workers = vec![
            tokio::spawn(Arc::clone(&conn).run_retry_timer()),
            tokio::spawn(dispatcher.run()),
            tokio::spawn(poller.run()),
        ];

        Ok(Self {
            conn,
            db,
            outbound: outbound_tx,
            events,
            shutdown_tx,
            workers,
            user_id: user.user_id,
            username: options.username,
        })
    }

    /// Queue one outgoing message. The durable outbox entry is written
    /// before the message enters the in-memory queue, so from this call's
    /// return onward a crash cannot lose it.
    pub async fn send(&self, recipient: &str, body: &str) -> Result<OutboxEntry, MessengerError> {
        if !auth::is_valid_identity(recipient) {
            return Err(MessengerError::InvalidRecipient(recipient.to_string()));
        }
        if body.trim().is_empty() {
            return Err(MessengerError::EmptyMessage);
        }

        let entry = self
            .db
            .outbox_append(self.user_id, recipient, body, unix_now())?;
        let message = OutgoingMessage {
            outbox_id: entry.outbox_id,
            recipient: entry.recipient.clone(),
            body: entry.body.clone(),
            timestamp: entry.timestamp,
        };
        self.outbound
            .send(message)
            .await
            .map_err(|_| MessengerError::Closed)?;
        Ok(entry)
    }

    /// One-shot fetch of the full message history the server holds (the
    /// legacy "all" query). Requires a live connection; the poller's
    /// incremental fetch is unaffected.
    pub async fn fetch_all(&self) -> Result<Vec<crate::messages::BatchEntry>, MessengerError> {
        match self
            .conn
            .request(|token| crate::messages::Request::new_fetch_all(token))
            .await
        {
            Ok(crate::messages::Response::Batch { messages }) => Ok(messages),
            Ok(_) => Err(MessengerError::Fetch(
                "unexpected reply to fetch-all; expected a message batch".to_string(),
            )),
            Err(err) => Err(MessengerError::Fetch(err.to_string())),
        }
    }

    /// Blocking pop on the inbound event queue.
    pub async fn next_event(&self) -> Option<Event> {
        self.events.pop().await
    }

    /// Non-blocking pop on the inbound event queue.
    pub fn try_next_event(&self) -> Option<Event> {
        self.events.try_pop()
    }

    pub fn connection_state(&self) -> LinkState {
        self.conn.state()
    }

    /// Subscribe to connection-state changes (the status indicator feed).
    pub fn watch_connection(&self) -> watch::Receiver<LinkState> {
        self.conn.watch_state()
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    /// Cooperative shutdown: every worker observes the signal at its next
    /// suspension point, then the transport is released. Any in-flight
    /// message either completed (entry cleared) or remains durable.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for worker in self.workers {
            if worker.await.is_err() {
                warn!("worker task panicked during shutdown");
            }
        }
        self.conn.close().await;
        info!("messenger shut down");
    }
}

/// Current wall-clock time as Unix seconds, the protocol's timestamp unit.
pub(crate) fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs_f64()
}
