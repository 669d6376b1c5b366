use crate::messages::wire::{self, FrameError, ProtocolError, MAX_FRAME_SIZE};
use crate::messages::{ReplyStatus, Request, Response};
use crate::network::backoff::BackoffPolicy;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

/// Observable connection state. Exactly one logical connection exists per
/// client; all transitions happen inside [`ConnectionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    BackingOff,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::BackingOff => "backing-off",
        }
    }
}

/// Transport-level failures. Any variant except `Timeout` (on a bare
/// `receive`) and `NotConnected` moves the connection into backoff.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {addr}: {source}")]
    ConnectFailed {
        addr: String,
        source: std::io::Error,
    },

    #[error("connect attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("server rejected the join handshake: {0}")]
    HandshakeRejected(String),

    #[error("i/o failure on the live transport: {0}")]
    Io(#[from] std::io::Error),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("connection lost")]
    ConnectionLost,

    #[error("not connected")]
    NotConnected,

    #[error("client is shutting down")]
    Shutdown,
}

impl From<FrameError> for TransportError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(e) => TransportError::Io(e),
            FrameError::ConnectionClosed => TransportError::ConnectionLost,
            // An oversized or non-UTF-8 frame leaves the stream mid-frame;
            // the session cannot be resynchronized.
            FrameError::TooLong { .. } | FrameError::InvalidUtf8 => TransportError::ConnectionLost,
        }
    }
}

/// Failures surfaced to the worker loops: either the transport broke (the
/// manager has already scheduled a reconnect) or one frame was garbage
/// (the connection is still fine).
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// `host:port` of the message server.
    pub addr: String,
    pub username: String,
    pub password: String,
    pub backoff: BackoffPolicy,
    pub connect_timeout: Duration,
    /// Bound on every blocking read so the pollers never stall.
    pub read_timeout: Duration,
}

/// A live, authenticated transport.
struct Session {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    token: String,
}

/// Mutable connection state, only ever touched under the manager's lock.
struct Link {
    session: Option<Session>,
    /// Consecutive failures in the current disconnection episode.
    attempt: u32,
    retry_at: Option<Instant>,
}

/// Owns the one transport and the reconnect state machine:
/// `Disconnected → Connecting → Connected → BackingOff → Connecting → …`.
///
/// Both worker loops share this as their single source of truth for "are we
/// connected". The internal mutex serializes every state transition and
/// in-flight operation, which is exactly the granularity the lockstep
/// request/response protocol needs: one exchange at a time, never an
/// interleaved reply.
pub struct ConnectionManager {
    opts: ConnectionOptions,
    link: Mutex<Link>,
    state_tx: watch::Sender<LinkState>,
    shutdown: watch::Receiver<bool>,
}

impl ConnectionManager {
    pub fn new(opts: ConnectionOptions, shutdown: watch::Receiver<bool>) -> Self {
        let (state_tx, _) = watch::channel(LinkState::Disconnected);
        Self {
            opts,
            link: Mutex::new(Link {
                session: None,
                attempt: 0,
                retry_at: None,
            }),
            state_tx,
            shutdown,
        }
    }

    /// Current state, without blocking.
    pub fn state(&self) -> LinkState {
        *self.state_tx.borrow()
    }

    /// Subscribe to state transitions (the presentation layer's status
    /// indicator).
    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, next: LinkState) {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            debug!(
                from = previous.as_str(),
                to = next.as_str(),
                "connection state change"
            );
        }
    }

    /// One connect attempt (transport open plus join handshake). On failure
    /// the manager enters `BackingOff` and schedules the next retry; use
    /// [`ensure_connected`](Self::ensure_connected) to wait through the
    /// schedule.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let mut link = self.link.lock().await;
        if link.session.is_some() {
            return Ok(());
        }
        self.connect_locked(&mut link).await
    }

    async fn connect_locked(&self, link: &mut MutexGuard<'_, Link>) -> Result<(), TransportError> {
        self.set_state(LinkState::Connecting);
        match self.open_session().await {
            Ok(session) => {
                info!(addr = %self.opts.addr, user = %self.opts.username, "connected and joined");
                link.session = Some(session);
                link.attempt = 0;
                link.retry_at = None;
                self.set_state(LinkState::Connected);
                Ok(())
            }
            Err(err) => {
                link.attempt += 1;
                let delay = self.opts.backoff.jittered(link.attempt);
                link.retry_at = Some(Instant::now() + delay);
                warn!(
                    attempt = link.attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "connect failed; backing off"
                );
                self.set_state(LinkState::BackingOff);
                Err(err)
            }
        }
    }

    /// Open the TCP stream and run the join handshake.
    async fn open_session(&self) -> Result<Session, TransportError> {
        let stream = timeout(self.opts.connect_timeout, TcpStream::connect(&self.opts.addr))
            .await
            .map_err(|_| TransportError::ConnectTimeout(self.opts.connect_timeout))?
            .map_err(|source| TransportError::ConnectFailed {
                addr: self.opts.addr.clone(),
                source,
            })?;
        let (read_half, write_half) = stream.into_split();
        let mut session = Session {
            reader: BufReader::new(read_half),
            writer: write_half,
            token: String::new(),
        };

        let join = Request::new_join(&self.opts.username, &self.opts.password);
        wire::write_frame(&mut session.writer, &wire::encode_request(&join))
            .await
            .map_err(TransportError::from)?;

        let frame = timeout(
            self.opts.read_timeout,
            wire::read_frame(&mut session.reader, MAX_FRAME_SIZE),
        )
        .await
        .map_err(|_| TransportError::Timeout(self.opts.read_timeout))?
        .map_err(TransportError::from)?;

        match wire::decode_response(&frame) {
            Ok(Response::Reply {
                status: ReplyStatus::Ok,
                token,
                ..
            }) => {
                session.token = token;
                Ok(session)
            }
            Ok(Response::Reply { message, .. }) => Err(TransportError::HandshakeRejected(message)),
            Ok(Response::Batch { .. }) => Err(TransportError::HandshakeRejected(
                "unexpected message batch in reply to join".to_string(),
            )),
            Err(err) => Err(TransportError::HandshakeRejected(err.to_string())),
        }
    }

    /// Wait until the connection is up, sleeping through the backoff
    /// schedule and retrying as deadlines pass. Returns `Err(Shutdown)`
    /// only when the shutdown signal fires; every other failure just
    /// extends the schedule.
    pub async fn ensure_connected(&self) -> Result<(), TransportError> {
        loop {
            if *self.shutdown.borrow() {
                return Err(TransportError::Shutdown);
            }

            // Read the deadline without holding the lock across the sleep,
            // so send/receive/close stay callable while we wait.
            let deadline = {
                let link = self.link.lock().await;
                if link.session.is_some() {
                    return Ok(());
                }
                link.retry_at
            };

            if let Some(deadline) = deadline {
                if Instant::now() < deadline {
                    let mut shutdown = self.shutdown.clone();
                    tokio::select! {
                        _ = sleep_until(deadline) => {}
                        _ = super::wait_for_shutdown(&mut shutdown) => {
                            return Err(TransportError::Shutdown);
                        }
                    }
                }
            }

            let mut link = self.link.lock().await;
            if link.session.is_some() {
                // another waiter won the race while we slept
                return Ok(());
            }
            if let Some(retry_at) = link.retry_at {
                if Instant::now() < retry_at {
                    continue;
                }
            }
            let _ = self.connect_locked(&mut link).await;
        }
    }

    /// Write one request frame on the live transport. I/O failure moves the
    /// connection into backoff and surfaces here; the caller owns message
    /// durability and re-send.
    pub async fn send(&self, request: &Request) -> Result<(), TransportError> {
        let mut link = self.link.lock().await;
        let session = link.session.as_mut().ok_or(TransportError::NotConnected)?;
        match wire::write_frame(&mut session.writer, &wire::encode_request(request)).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let err = TransportError::from(err);
                self.fail_locked(&mut link, &err);
                Err(err)
            }
        }
    }

    /// Read one response frame with a bounded timeout. A timeout leaves the
    /// session open; a framing failure tears it down; a malformed frame is
    /// reported as `ProtocolError` with the connection intact.
    pub async fn receive(&self) -> Result<Response, ClientError> {
        let mut link = self.link.lock().await;
        let session = link.session.as_mut().ok_or(TransportError::NotConnected)?;
        match timeout(
            self.opts.read_timeout,
            wire::read_frame(&mut session.reader, MAX_FRAME_SIZE),
        )
        .await
        {
            Err(_) => Err(TransportError::Timeout(self.opts.read_timeout).into()),
            Ok(Err(frame_err)) => {
                let err = TransportError::from(frame_err);
                self.fail_locked(&mut link, &err);
                Err(err.into())
            }
            Ok(Ok(frame)) => decode_logged(&frame).map_err(ClientError::Protocol),
        }
    }

    /// One lockstep exchange: encode and write the request built from the
    /// session token, then read and decode the single reply. A missing
    /// reply desynchronizes the stream, so unlike a bare `receive` a
    /// timeout here tears the session down.
    pub async fn request(
        &self,
        build: impl FnOnce(&str) -> Request,
    ) -> Result<Response, ClientError> {
        let mut link = self.link.lock().await;
        let session = link.session.as_mut().ok_or(TransportError::NotConnected)?;
        let request = build(&session.token);
        debug!(kind = request.kind(), "issuing request");

        if let Err(frame_err) =
            wire::write_frame(&mut session.writer, &wire::encode_request(&request)).await
        {
            let err = TransportError::from(frame_err);
            self.fail_locked(&mut link, &err);
            return Err(err.into());
        }

        match timeout(
            self.opts.read_timeout,
            wire::read_frame(&mut session.reader, MAX_FRAME_SIZE),
        )
        .await
        {
            Err(_) => {
                let err = TransportError::Timeout(self.opts.read_timeout);
                self.fail_locked(&mut link, &err);
                Err(err.into())
            }
            Ok(Err(frame_err)) => {
                let err = TransportError::from(frame_err);
                self.fail_locked(&mut link, &err);
                Err(err.into())
            }
            Ok(Ok(frame)) => decode_logged(&frame).map_err(ClientError::Protocol),
        }
    }

    /// The manager's own retry timer: keeps one connect attempt scheduled
    /// whenever the link is down, so inbound polling resumes even when
    /// nothing is being sent. Runs until shutdown.
    pub async fn run_retry_timer(self: Arc<Self>) {
        let mut state_rx = self.watch_state();
        let mut shutdown = self.shutdown.clone();
        loop {
            if self.ensure_connected().await.is_err() {
                return;
            }
            // connected; sleep until the link drops
            loop {
                tokio::select! {
                    _ = super::wait_for_shutdown(&mut shutdown) => return,
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        if *state_rx.borrow_and_update() != LinkState::Connected {
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Release the transport. Idempotent; does not touch the retry counter
    /// (only a successful connect resets it).
    pub async fn close(&self) {
        let mut link = self.link.lock().await;
        if link.session.take().is_some() {
            info!("connection closed");
        }
        link.retry_at = None;
        self.set_state(LinkState::Disconnected);
    }

    /// Drop the broken session and schedule the next reconnect.
    fn fail_locked(&self, link: &mut MutexGuard<'_, Link>, cause: &TransportError) {
        link.session = None;
        link.attempt += 1;
        let delay = self.opts.backoff.jittered(link.attempt);
        link.retry_at = Some(Instant::now() + delay);
        warn!(
            attempt = link.attempt,
            delay_ms = delay.as_millis() as u64,
            error = %cause,
            "transport failure; backing off"
        );
        self.set_state(LinkState::BackingOff);
    }
}

fn decode_logged(frame: &str) -> Result<Response, ProtocolError> {
    wire::decode_response(frame).map_err(|err| {
        warn!(error = %err, "discarding malformed frame; connection stays open");
        err
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn test_options(addr: String) -> ConnectionOptions {
        ConnectionOptions {
            addr,
            username: "alice".to_string(),
            password: "pw".to_string(),
            backoff: BackoffPolicy::new(Duration::from_millis(20), Duration::from_millis(100)),
            connect_timeout: Duration::from_millis(500),
            read_timeout: Duration::from_millis(500),
        }
    }

    fn manager(addr: String) -> (ConnectionManager, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        (ConnectionManager::new(test_options(addr), rx), tx)
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let (manager, _shutdown) = manager("127.0.0.1:1".to_string());
        assert_eq!(manager.state(), LinkState::Disconnected);
        let err = manager.send(&Request::new_fetch_new("t")).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
        assert!(matches!(
            manager.receive().await.unwrap_err(),
            ClientError::Transport(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_failed_connect_enters_backoff() {
        // nothing listens on port 1
        let (manager, _shutdown) = manager("127.0.0.1:1".to_string());
        assert!(manager.connect().await.is_err());
        assert_eq!(manager.state(), LinkState::BackingOff);

        // state transitions are monotonic within the episode
        assert!(manager.connect().await.is_err());
        assert_eq!(manager.state(), LinkState::BackingOff);
    }

    #[tokio::test]
    async fn test_connect_runs_join_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.split();
            let mut reader = BufReader::new(read_half);
            let frame = wire::read_frame(&mut reader, MAX_FRAME_SIZE).await.unwrap();
            let request = wire::decode_request(&frame).unwrap();
            assert_eq!(request, Request::new_join("alice", "pw"));
            write_half
                .write_all(b"{\"response\": {\"type\": \"ok\", \"message\": \"hi\", \"token\": \"tok-1\"}}\r\n")
                .await
                .unwrap();
            // hold the socket open until the client is done
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let (manager, _shutdown) = manager(addr);
        manager.connect().await.unwrap();
        assert_eq!(manager.state(), LinkState::Connected);
        manager.close().await;
        assert_eq!(manager.state(), LinkState::Disconnected);
        // close is idempotent
        manager.close().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_handshake_backs_off() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.split();
            let mut reader = BufReader::new(read_half);
            let _ = wire::read_frame(&mut reader, MAX_FRAME_SIZE).await.unwrap();
            write_half
                .write_all(b"{\"response\": {\"type\": \"error\", \"message\": \"bad password\"}}\r\n")
                .await
                .unwrap();
        });

        let (manager, _shutdown) = manager(addr);
        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, TransportError::HandshakeRejected(_)));
        assert_eq!(manager.state(), LinkState::BackingOff);
    }

    #[tokio::test]
    async fn test_ensure_connected_observes_shutdown() {
        let (manager, shutdown) = manager("127.0.0.1:1".to_string());
        let _ = manager.connect().await; // schedules a retry
        shutdown.send(true).unwrap();
        let err = manager.ensure_connected().await.unwrap_err();
        assert!(matches!(err, TransportError::Shutdown));
    }
}
