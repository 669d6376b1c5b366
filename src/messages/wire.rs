use crate::messages::types::{BatchEntry, Direction, ReplyStatus, Request, Response};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

/// Upper bound on a single wire frame. A legitimate frame is one JSON
/// object holding at most a message batch; anything larger is treated as
/// corruption rather than buffered without limit.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Decoding failure. The raw frame is retained for diagnostics; decoding is
/// total and never propagates a serde panic or error past this module.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not valid JSON: {frame:?}")]
    MalformedJson {
        frame: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("frame does not match the {expected} schema: {frame:?}")]
    SchemaMismatch {
        expected: &'static str,
        frame: String,
    },

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
}

/// Transport-level framing failure (distinct from `ProtocolError`: the
/// bytes never became a frame at all).
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("i/o error while framing: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer closed the connection")]
    ConnectionClosed,

    #[error("incoming frame exceeds the {max} byte limit")]
    TooLong { max: usize },

    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
}

// ---------------------------------------------------------------------------
// Pure codec
// ---------------------------------------------------------------------------

/// Encode a request as one JSON frame (no line terminator).
///
/// Encoding never fails for well-formed domain values; validation happens
/// upstream of the codec.
pub fn encode_request(request: &Request) -> String {
    let value = match request {
        Request::Join { username, password } => json!({
            "join": {
                "username": username,
                "password": password,
                "token": "",
            }
        }),
        Request::Post {
            token,
            recipient,
            body,
            timestamp,
        } => json!({
            "token": token,
            "directmessage": {
                "entry": body,
                "recipient": recipient,
                "timestamp": timestamp.to_string(),
            }
        }),
        Request::FetchNew { token } => json!({
            "token": token,
            "directmessage": "new",
        }),
        Request::FetchAll { token } => json!({
            "token": token,
            "directmessage": "all",
        }),
    };
    value.to_string()
}

/// Encode a response as one JSON frame (no line terminator).
pub fn encode_response(response: &Response) -> String {
    let value = match response {
        Response::Reply {
            status,
            message,
            token,
        } => json!({
            "response": {
                "type": status.as_str(),
                "message": message,
                "token": token,
            }
        }),
        Response::Batch { messages } => {
            let entries: Vec<Value> = messages
                .iter()
                .map(|entry| {
                    let mut map = Map::new();
                    match &entry.direction {
                        Direction::Received { sender } => {
                            map.insert("from".into(), Value::String(sender.clone()));
                        }
                        Direction::Sent { recipient } => {
                            map.insert("recipient".into(), Value::String(recipient.clone()));
                        }
                    }
                    map.insert("message".into(), Value::String(entry.body.clone()));
                    map.insert(
                        "timestamp".into(),
                        Value::String(entry.timestamp.to_string()),
                    );
                    Value::Object(map)
                })
                .collect();
            json!({
                "response": {
                    "type": "ok",
                    "messages": entries,
                }
            })
        }
    };
    value.to_string()
}

/// Decode a server response frame.
pub fn decode_response(frame: &str) -> Result<Response, ProtocolError> {
    let root = parse_object(frame, "response")?;
    let response = root
        .get("response")
        .and_then(Value::as_object)
        .ok_or_else(|| ProtocolError::SchemaMismatch {
            expected: "response",
            frame: frame.to_string(),
        })?;

    if let Some(raw_entries) = response.get("messages") {
        let raw_entries =
            raw_entries
                .as_array()
                .ok_or_else(|| ProtocolError::SchemaMismatch {
                    expected: "message batch",
                    frame: frame.to_string(),
                })?;
        let mut messages = Vec::with_capacity(raw_entries.len());
        for raw in raw_entries {
            match decode_batch_entry(raw) {
                Some(entry) => messages.push(entry),
                None => warn!(entry = %raw, "skipping malformed batch entry"),
            }
        }
        return Ok(Response::Batch { messages });
    }

    let status = response
        .get("type")
        .and_then(Value::as_str)
        .and_then(ReplyStatus::from_str)
        .ok_or_else(|| ProtocolError::SchemaMismatch {
            expected: "response",
            frame: frame.to_string(),
        })?;
    Ok(Response::Reply {
        status,
        message: string_field(response, "message"),
        token: string_field(response, "token"),
    })
}

/// Decode a client request frame (used by the scripted test server and any
/// future local echo tooling; the live client only encodes requests).
pub fn decode_request(frame: &str) -> Result<Request, ProtocolError> {
    let root = parse_object(frame, "request")?;

    if let Some(join) = root.get("join").and_then(Value::as_object) {
        let username = join.get("username").and_then(Value::as_str);
        let password = join.get("password").and_then(Value::as_str);
        return match (username, password) {
            (Some(username), Some(password)) => Ok(Request::new_join(username, password)),
            _ => Err(ProtocolError::SchemaMismatch {
                expected: "join request",
                frame: frame.to_string(),
            }),
        };
    }

    let token = root.get("token").and_then(Value::as_str).unwrap_or("");
    match root.get("directmessage") {
        Some(Value::String(which)) if which == "new" => Ok(Request::new_fetch_new(token)),
        Some(Value::String(which)) if which == "all" => Ok(Request::new_fetch_all(token)),
        Some(Value::Object(dm)) => {
            let body = dm.get("entry").and_then(Value::as_str);
            let recipient = dm.get("recipient").and_then(Value::as_str);
            match (body, recipient) {
                (Some(body), Some(recipient)) => Ok(Request::new_post(
                    token,
                    recipient,
                    body,
                    dm.get("timestamp").map_or(0.0, timestamp_value),
                )),
                _ => Err(ProtocolError::SchemaMismatch {
                    expected: "direct message request",
                    frame: frame.to_string(),
                }),
            }
        }
        _ => Err(ProtocolError::SchemaMismatch {
            expected: "request",
            frame: frame.to_string(),
        }),
    }
}

fn parse_object(frame: &str, expected: &'static str) -> Result<Map<String, Value>, ProtocolError> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            len: frame.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let value: Value = serde_json::from_str(frame).map_err(|source| ProtocolError::MalformedJson {
        frame: frame.to_string(),
        source,
    })?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(ProtocolError::SchemaMismatch {
            expected,
            frame: frame.to_string(),
        }),
    }
}

/// One batch entry. Entries missing a body or an identity field are dropped
/// (the server is allowed to pad batches with records we cannot attribute);
/// a missing timestamp decodes as 0.0 rather than discarding the message.
fn decode_batch_entry(raw: &Value) -> Option<BatchEntry> {
    let obj = raw.as_object()?;
    let body = obj.get("message").and_then(Value::as_str)?;
    let timestamp = obj.get("timestamp").map_or(0.0, timestamp_value);
    if let Some(sender) = obj.get("from").and_then(Value::as_str) {
        Some(BatchEntry::received(sender, body, timestamp))
    } else {
        obj.get("recipient")
            .and_then(Value::as_str)
            .map(|recipient| BatchEntry::sent(recipient, body, timestamp))
    }
}

/// Timestamps arrive as stringified floats from the reference server but
/// some deployments send bare numbers; accept both.
fn timestamp_value(value: &Value) -> f64 {
    match value {
        Value::String(s) => s.parse().unwrap_or(0.0),
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn string_field(obj: &Map<String, Value>, key: &str) -> String {
    obj.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

// ---------------------------------------------------------------------------
// Line framing over an async transport
// ---------------------------------------------------------------------------

/// Read one newline-terminated frame, enforcing `max_len` while the bytes
/// stream in so a hostile peer cannot force unbounded buffering. The
/// terminator (and an optional preceding `\r`) is stripped.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<String, FrameError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line: Vec<u8> = Vec::new();
    loop {
        let (consumed, done) = {
            let buf = reader.fill_buf().await?;
            if buf.is_empty() {
                return Err(FrameError::ConnectionClosed);
            }
            match buf.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    line.extend_from_slice(&buf[..pos]);
                    (pos + 1, true)
                }
                None => {
                    line.extend_from_slice(buf);
                    (buf.len(), false)
                }
            }
        };
        reader.consume(consumed);
        if line.len() > max_len {
            return Err(FrameError::TooLong { max: max_len });
        }
        if done {
            break;
        }
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line).map_err(|_| FrameError::InvalidUtf8)
}

/// Write one frame followed by the `\r\n` terminator and flush.
pub async fn write_frame<W>(writer: &mut W, frame: &str) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await?;
    Ok(())
}
