use crate::messages::{Direction, IncomingMessage, Request, Response};
use crate::network::connection::{ClientError, ConnectionManager, LinkState};
use crate::network::mailbox::MailboxSender;
use crate::network::messenger::Event;
use crate::storage::Database;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// The periodic worker that fetches new messages from the server and feeds
/// the inbound queue in server-delivery order.
pub struct InboundPoller {
    pub(crate) conn: Arc<ConnectionManager>,
    pub(crate) db: Arc<Database>,
    pub(crate) user_id: i64,
    pub(crate) username: String,
    pub(crate) events: MailboxSender<Event>,
    pub(crate) interval: Duration,
    pub(crate) shutdown: watch::Receiver<bool>,
    pub(crate) seen: DedupeWindow,
}

impl InboundPoller {
    pub async fn run(mut self) {
        info!(interval_ms = self.interval.as_millis() as u64, "inbound poller started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = super::wait_for_shutdown(&mut self.shutdown) => break,
                _ = ticker.tick() => {
                    if !self.tick().await {
                        break;
                    }
                }
            }
        }
        info!("inbound poller stopped");
    }

    /// One poll cycle. Returns `false` when the inbound queue has closed
    /// and the worker should exit.
    async fn tick(&mut self) -> bool {
        // Absence of a link is already visible via connection state; a
        // skipped tick is not an error.
        if self.conn.state() != LinkState::Connected {
            return true;
        }

        match self.conn.request(|token| Request::new_fetch_new(token)).await {
            Ok(Response::Batch { messages }) => {
                for entry in messages {
                    let Direction::Received { sender } = entry.direction else {
                        // fetch-new only ever returns messages sent to us
                        warn!("ignoring sent-direction entry in fetch-new batch");
                        continue;
                    };
                    if !self.seen.insert(&sender, entry.timestamp, &entry.body) {
                        debug!(sender = %sender, "suppressing duplicate inbound message");
                        continue;
                    }
                    if let Err(err) = self.db.add_message(
                        self.user_id,
                        &sender,
                        &self.username,
                        &entry.body,
                        entry.timestamp,
                    ) {
                        error!(error = %err, "failed to record inbound message in history");
                    }
                    if let Err(err) = self.db.contact_add(self.user_id, &sender) {
                        error!(error = %err, "failed to record contact");
                    }
                    let incoming = IncomingMessage {
                        sender,
                        body: entry.body,
                        timestamp: entry.timestamp,
                    };
                    if !self.emit(Event::Received(incoming)).await {
                        return false;
                    }
                }
            }
            Ok(_) => {
                warn!("unexpected reply to fetch-new; expected a message batch");
            }
            Err(ClientError::Protocol(err)) => {
                // frame discarded, connection stays open, next tick proceeds
                warn!(error = %err, "malformed frame during poll");
            }
            Err(ClientError::Transport(err)) => {
                // the manager has already scheduled the reconnect
                debug!(error = %err, "poll failed; connection entering backoff");
            }
        }
        true
    }

    /// Push an event unless shutdown fires first; the message is already
    /// in local history at this point, and a worker wedged on a full
    /// queue would block shutdown.
    async fn emit(&mut self, event: Event) -> bool {
        tokio::select! {
            sent = self.events.send(event) => sent.is_ok(),
            _ = super::wait_for_shutdown(&mut self.shutdown) => false,
        }
    }
}

/// Idempotence filter at the inbound queue boundary, keyed on
/// (sender, timestamp, body) over a bounded recent window.
pub(crate) struct DedupeWindow {
    seen: HashSet<(String, u64, String)>,
    order: VecDeque<(String, u64, String)>,
    capacity: usize,
}

impl DedupeWindow {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record a message key; `false` means it was already in the window.
    pub(crate) fn insert(&mut self, sender: &str, timestamp: f64, body: &str) -> bool {
        let key = (sender.to_string(), timestamp.to_bits(), body.to_string());
        if self.seen.contains(&key) {
            return false;
        }
        while self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(key.clone());
        self.seen.insert(key);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedupe_window_rejects_repeats() {
        let mut window = DedupeWindow::new(8);
        assert!(window.insert("alice", 1.0, "hi"));
        assert!(!window.insert("alice", 1.0, "hi"));
        // any field difference makes a distinct message
        assert!(window.insert("alice", 2.0, "hi"));
        assert!(window.insert("bob", 1.0, "hi"));
        assert!(window.insert("alice", 1.0, "hi there"));
    }

    #[test]
    fn test_dedupe_window_evicts_oldest() {
        let mut window = DedupeWindow::new(2);
        assert!(window.insert("a", 1.0, "m1"));
        assert!(window.insert("b", 2.0, "m2"));
        assert!(window.insert("c", 3.0, "m3")); // evicts m1
        assert!(window.insert("a", 1.0, "m1"));
    }
}
