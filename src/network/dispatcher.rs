use crate::messages::{DeliveryStatus, OutgoingMessage, Request, Response};
use crate::network::connection::{ClientError, ConnectionManager, TransportError};
use crate::network::mailbox::{Mailbox, MailboxSender};
use crate::network::messenger::Event;
use crate::storage::Database;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// The single worker that drains the outbound-intake queue.
///
/// Every message it holds is already durable (the messenger appends the
/// outbox entry before enqueueing), so the loop can be interrupted at any
/// suspension point without losing anything: a send either completes and
/// clears the durable entry, or the entry stays pending for the next run.
pub struct OutgoingDispatcher {
    pub(crate) conn: Arc<ConnectionManager>,
    pub(crate) db: Arc<Database>,
    pub(crate) user_id: i64,
    pub(crate) username: String,
    pub(crate) outbound: Arc<Mailbox<OutgoingMessage>>,
    pub(crate) events: MailboxSender<Event>,
    pub(crate) max_retries: u32,
    /// Pause between retries of a send the server rejected, so a live but
    /// unhappy connection is not hammered.
    pub(crate) retry_pause: Duration,
    pub(crate) shutdown: watch::Receiver<bool>,
}

impl OutgoingDispatcher {
    pub async fn run(mut self) {
        info!("outgoing dispatcher started");
        loop {
            let message = tokio::select! {
                _ = super::wait_for_shutdown(&mut self.shutdown) => break,
                message = self.outbound.pop() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            if !self.deliver(message).await {
                break;
            }
        }
        info!("outgoing dispatcher stopped");
    }

    /// Drive one message to a terminal outcome: confirmed, exhausted, or
    /// left durable at shutdown. Returns `false` when the loop should exit.
    async fn deliver(&mut self, message: OutgoingMessage) -> bool {
        loop {
            match self.conn.ensure_connected().await {
                Ok(()) => {}
                // only shutdown escapes ensure_connected; entry stays durable
                Err(_) => return false,
            }

            let result = self
                .conn
                .request(|token| {
                    Request::new_post(token, &message.recipient, &message.body, message.timestamp)
                })
                .await;

            match result {
                Ok(response) if response.is_ok_reply() => {
                    self.confirm(&message).await;
                    return true;
                }
                Ok(Response::Reply { message: reason, .. }) => {
                    warn!(
                        outbox_id = message.outbox_id,
                        recipient = %message.recipient,
                        reason = %reason,
                        "server rejected message"
                    );
                    if self.record_failure(&message).await {
                        return true;
                    }
                    // connection is healthy; wait out the base delay before retrying
                    if !self.pause().await {
                        return false;
                    }
                }
                Ok(Response::Batch { .. }) => {
                    warn!(
                        outbox_id = message.outbox_id,
                        "unexpected message batch in reply to post"
                    );
                    if self.record_failure(&message).await {
                        return true;
                    }
                    if !self.pause().await {
                        return false;
                    }
                }
                Err(ClientError::Protocol(err)) => {
                    warn!(
                        outbox_id = message.outbox_id,
                        error = %err,
                        "unreadable reply to post"
                    );
                    if self.record_failure(&message).await {
                        return true;
                    }
                    if !self.pause().await {
                        return false;
                    }
                }
                Err(ClientError::Transport(TransportError::Shutdown)) => return false,
                Err(ClientError::Transport(err)) => {
                    debug!(
                        outbox_id = message.outbox_id,
                        error = %err,
                        "send failed; will retry once reconnected"
                    );
                    if self.record_failure(&message).await {
                        return true;
                    }
                    // the manager is backing off; ensure_connected waits it out
                }
            }
        }
    }

    /// Server acknowledged the message: clear the durable entry, record it
    /// in local history, and report success upstream.
    async fn confirm(&mut self, message: &OutgoingMessage) {
        debug!(
            outbox_id = message.outbox_id,
            recipient = %message.recipient,
            "message acknowledged"
        );
        if let Err(err) = self.db.outbox_mark_sent(message.outbox_id) {
            // delivered but still durable: re-sent after restart rather than lost
            error!(outbox_id = message.outbox_id, error = %err, "failed to clear outbox entry");
        }
        if let Err(err) = self.db.add_message(
            self.user_id,
            &self.username,
            &message.recipient,
            &message.body,
            message.timestamp,
        ) {
            error!(error = %err, "failed to record sent message in history");
        }
        if let Err(err) = self.db.contact_add(self.user_id, &message.recipient) {
            error!(error = %err, "failed to record contact");
        }
        self.emit(Event::Delivery {
            outbox_id: message.outbox_id,
            recipient: message.recipient.clone(),
            status: DeliveryStatus::Confirmed,
            attempts: 0,
        })
        .await;
    }

    /// Count one failed attempt against the durable entry. Returns `true`
    /// when the retry budget is exhausted and the message has been moved to
    /// its terminal state (reported upstream exactly once).
    async fn record_failure(&mut self, message: &OutgoingMessage) -> bool {
        let attempts = match self.db.outbox_increment_attempt(message.outbox_id) {
            Ok(attempts) => attempts,
            Err(err) => {
                error!(
                    outbox_id = message.outbox_id,
                    error = %err,
                    "failed to record delivery attempt"
                );
                return false;
            }
        };
        if attempts <= self.max_retries {
            return false;
        }

        warn!(
            outbox_id = message.outbox_id,
            recipient = %message.recipient,
            attempts,
            "delivery exhausted; entry retained as failed"
        );
        if let Err(err) = self.db.outbox_mark_failed(message.outbox_id) {
            error!(outbox_id = message.outbox_id, error = %err, "failed to mark entry failed");
        }
        self.emit(Event::Delivery {
            outbox_id: message.outbox_id,
            recipient: message.recipient.clone(),
            status: DeliveryStatus::Failed,
            attempts,
        })
        .await;
        true
    }

    /// Push an event unless shutdown fires first; a report lost to
    /// shutdown is acceptable, a worker wedged on a full queue is not.
    async fn emit(&mut self, event: Event) -> bool {
        tokio::select! {
            sent = self.events.send(event) => sent.is_ok(),
            _ = super::wait_for_shutdown(&mut self.shutdown) => false,
        }
    }

    /// Sleep between rejected-send retries. Returns `false` when shutdown
    /// fired during the pause.
    async fn pause(&mut self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.retry_pause) => true,
            _ = super::wait_for_shutdown(&mut self.shutdown) => false,
        }
    }
}
