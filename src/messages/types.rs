use serde::{Deserialize, Serialize};

/// A client-to-server request on the wire protocol.
///
/// The JSON shape of each variant is fixed by the server (see `wire.rs`);
/// these values are what the rest of the crate works with.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Authenticate and open a session. The server answers with an ack
    /// carrying the session token used by every other request.
    Join { username: String, password: String },
    /// Post one direct message to a recipient.
    Post {
        token: String,
        recipient: String,
        body: String,
        timestamp: f64,
    },
    /// Ask for messages received since the last fetch.
    FetchNew { token: String },
    /// Ask for the full message history held by the server.
    FetchAll { token: String },
}

impl Request {
    pub fn new_join(username: impl Into<String>, password: impl Into<String>) -> Self {
        Request::Join {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn new_post(
        token: impl Into<String>,
        recipient: impl Into<String>,
        body: impl Into<String>,
        timestamp: f64,
    ) -> Self {
        Request::Post {
            token: token.into(),
            recipient: recipient.into(),
            body: body.into(),
            timestamp,
        }
    }

    pub fn new_fetch_new(token: impl Into<String>) -> Self {
        Request::FetchNew {
            token: token.into(),
        }
    }

    pub fn new_fetch_all(token: impl Into<String>) -> Self {
        Request::FetchAll {
            token: token.into(),
        }
    }

    /// Get the request kind as a string (used in logs).
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Join { .. } => "join",
            Request::Post { .. } => "post",
            Request::FetchNew { .. } => "fetch-new",
            Request::FetchAll { .. } => "fetch-all",
        }
    }
}

/// Outcome flag carried by every server ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyStatus {
    Ok,
    Error,
}

impl ReplyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplyStatus::Ok => "ok",
            ReplyStatus::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ok" => Some(ReplyStatus::Ok),
            "error" => Some(ReplyStatus::Error),
            _ => None,
        }
    }
}

/// A server-to-client response frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Plain acknowledgement: join results and post-message acks.
    /// `token` is empty unless the server issued one (join).
    Reply {
        status: ReplyStatus,
        message: String,
        token: String,
    },
    /// An ordered batch of messages answering a fetch request.
    Batch { messages: Vec<BatchEntry> },
}

impl Response {
    pub fn ok(message: impl Into<String>, token: impl Into<String>) -> Self {
        Response::Reply {
            status: ReplyStatus::Ok,
            message: message.into(),
            token: token.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Response::Reply {
            status: ReplyStatus::Error,
            message: message.into(),
            token: String::new(),
        }
    }

    pub fn batch(messages: Vec<BatchEntry>) -> Self {
        Response::Batch { messages }
    }

    /// True for a `Reply` whose status is `Ok`.
    pub fn is_ok_reply(&self) -> bool {
        matches!(
            self,
            Response::Reply {
                status: ReplyStatus::Ok,
                ..
            }
        )
    }
}

/// Whether a batch entry was received from a peer or previously sent by us.
/// Fetch-new batches only ever contain `Received` entries; fetch-all mixes
/// both, distinguished on the wire by which identity field is present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Direction {
    Received { sender: String },
    Sent { recipient: String },
}

impl Direction {
    /// The peer on the other end, whichever way the message travelled.
    pub fn peer(&self) -> &str {
        match self {
            Direction::Received { sender } => sender,
            Direction::Sent { recipient } => recipient,
        }
    }
}

/// One message inside a batch response.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEntry {
    pub direction: Direction,
    pub body: String,
    pub timestamp: f64,
}

impl BatchEntry {
    pub fn received(sender: impl Into<String>, body: impl Into<String>, timestamp: f64) -> Self {
        BatchEntry {
            direction: Direction::Received {
                sender: sender.into(),
            },
            body: body.into(),
            timestamp,
        }
    }

    pub fn sent(recipient: impl Into<String>, body: impl Into<String>, timestamp: f64) -> Self {
        BatchEntry {
            direction: Direction::Sent {
                recipient: recipient.into(),
            },
            body: body.into(),
            timestamp,
        }
    }
}

/// Lifecycle of an outgoing message as seen by the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Queued (durably) and not yet acknowledged.
    Pending,
    /// Written to the transport, ack outstanding.
    Sent,
    /// Retry budget exhausted; retained in the outbox for inspection.
    Failed,
    /// Acknowledged by the server.
    Confirmed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Confirmed => "confirmed",
        }
    }
}

/// An outgoing message travelling through the intake queue. The durable
/// outbox entry identified by `outbox_id` is written before this value is
/// enqueued, so dropping it never loses the message.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub outbox_id: i64,
    pub recipient: String,
    pub body: String,
    pub timestamp: f64,
}

/// An inbound message decoded from a poll batch, in server-delivery order.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub sender: String,
    pub body: String,
    pub timestamp: f64,
}
