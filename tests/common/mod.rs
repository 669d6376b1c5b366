// Each test binary compiles this module separately and uses a different
// slice of it.
#![allow(dead_code)]

//! Scripted in-process message server for integration tests.
//!
//! Speaks the real wire protocol through the crate's own codec, records
//! what it receives, and follows per-request scripts so tests can inject
//! rejections, malformed frames, stalls and dropped connections.

use courier::messages::{
    decode_request, encode_response, read_frame, write_frame, Request, Response, MAX_FRAME_SIZE,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Scripted reply to a post request.
#[derive(Debug, Clone)]
pub enum PostScript {
    /// Acknowledge and record the message.
    Ok,
    /// Reject with an error reply; the connection stays open.
    Error(&'static str),
    /// Close the connection without replying.
    DropConnection,
}

/// Scripted reply to a fetch request.
#[derive(Debug, Clone)]
pub enum FetchScript {
    /// Send a raw frame verbatim (allows malformed data).
    Frame(String),
    /// Never reply, forcing the client's read timeout.
    Stall,
}

#[derive(Default)]
pub struct ServerState {
    joins: AtomicU32,
    refuse: AtomicBool,
    posts: Mutex<Vec<(String, String)>>,
    post_scripts: Mutex<VecDeque<PostScript>>,
    default_post: Mutex<Option<PostScript>>,
    fetch_scripts: Mutex<VecDeque<FetchScript>>,
    fetch_all_scripts: Mutex<VecDeque<FetchScript>>,
}

pub struct TestServer {
    pub addr: String,
    state: Arc<ServerState>,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let state = Arc::new(ServerState::default());
        let accept_state = Arc::clone(&state);
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                if accept_state.refuse.load(Ordering::SeqCst) {
                    drop(stream);
                    continue;
                }
                tokio::spawn(handle_connection(stream, Arc::clone(&accept_state)));
            }
        });
        Self { addr, state, handle }
    }

    /// While set, new connections are dropped before the handshake.
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Queue replies for upcoming post requests, consumed in order.
    pub fn script_posts(&self, scripts: Vec<PostScript>) {
        self.state.post_scripts.lock().unwrap().extend(scripts);
    }

    /// Reply used for posts once the script queue is drained (default: Ok).
    pub fn set_default_post(&self, script: PostScript) {
        *self.state.default_post.lock().unwrap() = Some(script);
    }

    /// Queue a batch response for an upcoming fetch request.
    pub fn queue_fetch_response(&self, response: &Response) {
        self.queue_fetch_frame(encode_response(response));
    }

    /// Queue a raw frame for an upcoming fetch request.
    pub fn queue_fetch_frame(&self, frame: impl Into<String>) {
        self.state
            .fetch_scripts
            .lock()
            .unwrap()
            .push_back(FetchScript::Frame(frame.into()));
    }

    /// Make one upcoming fetch request hang with no reply.
    pub fn queue_fetch_stall(&self) {
        self.state
            .fetch_scripts
            .lock()
            .unwrap()
            .push_back(FetchScript::Stall);
    }

    /// Queue a batch response for an upcoming fetch-all request.
    pub fn queue_fetch_all_response(&self, response: &Response) {
        self.state
            .fetch_all_scripts
            .lock()
            .unwrap()
            .push_back(FetchScript::Frame(encode_response(response)));
    }

    /// Messages acknowledged so far, in arrival order.
    pub fn posts(&self) -> Vec<(String, String)> {
        self.state.posts.lock().unwrap().clone()
    }

    /// Completed join handshakes so far.
    pub fn join_count(&self) -> u32 {
        self.state.joins.load(Ordering::SeqCst)
    }

    pub async fn stop(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<ServerState>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    loop {
        let Ok(frame) = read_frame(&mut reader, MAX_FRAME_SIZE).await else {
            return;
        };
        let Ok(request) = decode_request(&frame) else {
            let reply = encode_response(&Response::error("unreadable request"));
            if write_frame(&mut write_half, &reply).await.is_err() {
                return;
            }
            continue;
        };

        let is_fetch_all = matches!(request, Request::FetchAll { .. });
        match request {
            Request::Join { .. } => {
                let n = state.joins.fetch_add(1, Ordering::SeqCst) + 1;
                let reply = Response::ok("Join successful", format!("tok-{n}"));
                if write_frame(&mut write_half, &encode_response(&reply))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Request::Post {
                recipient, body, ..
            } => {
                let script = state
                    .post_scripts
                    .lock()
                    .unwrap()
                    .pop_front()
                    .or_else(|| state.default_post.lock().unwrap().clone())
                    .unwrap_or(PostScript::Ok);
                match script {
                    PostScript::Ok => {
                        state.posts.lock().unwrap().push((recipient, body));
                        let reply = Response::ok("Message sent", "");
                        if write_frame(&mut write_half, &encode_response(&reply))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    PostScript::Error(reason) => {
                        let reply = Response::error(reason);
                        if write_frame(&mut write_half, &encode_response(&reply))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    PostScript::DropConnection => return,
                }
            }
            Request::FetchNew { .. } | Request::FetchAll { .. } => {
                let queue = if is_fetch_all {
                    &state.fetch_all_scripts
                } else {
                    &state.fetch_scripts
                };
                let script = queue.lock().unwrap().pop_front();
                match script {
                    Some(FetchScript::Frame(frame)) => {
                        if write_frame(&mut write_half, &frame).await.is_err() {
                            return;
                        }
                    }
                    Some(FetchScript::Stall) => {
                        // hold the connection open until the client gives up
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        return;
                    }
                    None => {
                        let reply = encode_response(&Response::batch(vec![]));
                        if write_frame(&mut write_half, &reply).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Poll `condition` until it holds or the timeout elapses.
pub async fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Messenger options tuned for fast test cycles.
pub fn fast_options(addr: &str, username: &str) -> courier::MessengerOptions {
    let mut options = courier::MessengerOptions::new(addr, username, "pw");
    options.poll_interval = Duration::from_millis(50);
    options.max_retries = 5;
    options.backoff = courier::network::BackoffPolicy::new(
        Duration::from_millis(20),
        Duration::from_millis(200),
    );
    options.connect_timeout = Duration::from_millis(500);
    options.read_timeout = Duration::from_millis(400);
    options
}

/// An address nothing is listening on.
pub async fn dead_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    addr
}
