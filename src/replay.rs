//! Response replay subsystem
//!
//! While a response streams to its client, the replay branch duplicates
//! every chunk into a [`ResponseReplay`] that a loopback-only listener
//! serves in real time at `http://127.0.0.1:<port>/replay/<message_id>`.
//! Replays are one-shot: the first GET atomically removes the entry. An
//! orphan pruner sweeps terminal replays nobody fetched.

use bytes::Bytes;
use dashmap::DashMap;
use http::{Request, Response, StatusCode};
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, warn};

use crate::message::MessageInfo;
use crate::proxy::{empty_body, stream_body, ProxyBody};

/// Per-replay buffer cap. Writes beyond this fail and the engine abandons
/// the replay, presuming the host never connected.
pub const MAX_REPLAY_BUFFER_BYTES: usize = 65_535_000;

/// Poll interval of the serving loop while the queue is empty.
const DRAIN_IDLE_WAIT: Duration = Duration::from_millis(10);

/// Sweep interval for replays nobody fetched.
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// A real-time duplicate of one upstream response.
pub struct ResponseReplay {
    message_info: Arc<MessageInfo>,
    queue: Mutex<VecDeque<Bytes>>,
    queued_bytes: AtomicUsize,
    body_complete: AtomicBool,
    replay_aborted: AtomicBool,
    source_aborted: AtomicBool,
    close_source: AtomicBool,
    replay_url: String,
}

impl ResponseReplay {
    pub(crate) fn new(message_info: Arc<MessageInfo>, replay_port: u16) -> Self {
        let replay_url = format!(
            "http://127.0.0.1:{}/replay/{}",
            replay_port, message_info.message_id
        );
        Self {
            message_info,
            queue: Mutex::new(VecDeque::new()),
            queued_bytes: AtomicUsize::new(0),
            body_complete: AtomicBool::new(false),
            replay_aborted: AtomicBool::new(false),
            source_aborted: AtomicBool::new(false),
            close_source: AtomicBool::new(false),
            replay_url,
        }
    }

    pub fn message_id(&self) -> u32 {
        self.message_info.message_id
    }

    /// The loopback URL this replay is served from.
    pub fn replay_url(&self) -> &str {
        &self.replay_url
    }

    pub(crate) fn message_info(&self) -> &Arc<MessageInfo> {
        &self.message_info
    }

    /// Enqueue a copy of one source chunk. Returns false when the buffer
    /// cap would be exceeded; the caller abandons the replay.
    pub(crate) fn write_body_bytes(&self, chunk: Bytes) -> bool {
        let queued = self.queued_bytes.load(Ordering::Acquire);
        if queued + chunk.len() > MAX_REPLAY_BUFFER_BYTES {
            return false;
        }
        self.queued_bytes.fetch_add(chunk.len(), Ordering::AcqRel);
        self.queue.lock().push_back(chunk);
        true
    }

    pub(crate) fn next_chunk(&self) -> Option<Bytes> {
        let chunk = self.queue.lock().pop_front();
        if let Some(ref c) = chunk {
            self.queued_bytes.fetch_sub(c.len(), Ordering::AcqRel);
        }
        chunk
    }

    pub(crate) fn queue_is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub(crate) fn mark_body_complete(&self) {
        self.body_complete.store(true, Ordering::Release);
    }

    pub(crate) fn mark_source_aborted(&self) {
        self.source_aborted.store(true, Ordering::Release);
    }

    pub(crate) fn mark_replay_aborted(&self) {
        self.replay_aborted.store(true, Ordering::Release);
    }

    pub fn body_complete(&self) -> bool {
        self.body_complete.load(Ordering::Acquire)
    }

    pub fn replay_aborted(&self) -> bool {
        self.replay_aborted.load(Ordering::Acquire)
    }

    pub fn source_aborted(&self) -> bool {
        self.source_aborted.load(Ordering::Acquire)
    }

    pub(crate) fn should_close_source(&self) -> bool {
        self.close_source.load(Ordering::Acquire)
    }

    /// Any terminal flag set: the pruner may reclaim this entry.
    pub(crate) fn is_terminal(&self) -> bool {
        self.body_complete() || self.replay_aborted() || self.source_aborted()
    }
}

impl std::fmt::Debug for ResponseReplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseReplay")
            .field("message_id", &self.message_id())
            .field("queued_bytes", &self.queued_bytes.load(Ordering::Relaxed))
            .field("body_complete", &self.body_complete())
            .field("replay_aborted", &self.replay_aborted())
            .field("source_aborted", &self.source_aborted())
            .finish()
    }
}

/// Host-facing handle for one replay, given to the replay callback.
#[derive(Clone)]
pub struct ReplayControl {
    replay: Arc<ResponseReplay>,
}

impl ReplayControl {
    pub(crate) fn new(replay: Arc<ResponseReplay>) -> Self {
        Self { replay }
    }

    /// URL the duplicate is served from.
    pub fn replay_url(&self) -> &str {
        self.replay.replay_url()
    }

    pub fn message_id(&self) -> u32 {
        self.replay.message_id()
    }

    /// Cancel the duplicate. With `close_source_stream` the original
    /// downstream response is torn down as well; otherwise it keeps
    /// streaming untouched.
    pub fn terminate(&self, close_source_stream: bool) {
        self.replay.mark_replay_aborted();
        if close_source_stream {
            self.replay.close_source.store(true, Ordering::Release);
        }
    }
}

/// Concurrent map of in-flight replays keyed by message id.
#[derive(Debug, Default)]
pub(crate) struct ReplayRegistry {
    replays: DashMap<u32, Arc<ResponseReplay>>,
}

impl ReplayRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, replay: Arc<ResponseReplay>) {
        self.replays.insert(replay.message_id(), replay);
    }

    /// Atomically remove and return the replay for `message_id`.
    pub(crate) fn take(&self, message_id: u32) -> Option<Arc<ResponseReplay>> {
        self.replays.remove(&message_id).map(|(_, replay)| replay)
    }

    pub(crate) fn remove(&self, message_id: u32) {
        self.replays.remove(&message_id);
    }

    pub(crate) fn len(&self) -> usize {
        self.replays.len()
    }

    /// Drop every replay with a terminal flag. Returns how many went.
    pub(crate) fn prune(&self) -> usize {
        let before = self.replays.len();
        self.replays.retain(|_, replay| !replay.is_terminal());
        before - self.replays.len()
    }
}

/// Background sweeper for replays the host never fetched.
pub(crate) fn spawn_pruner(
    registry: Arc<ReplayRegistry>,
    running: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(PRUNE_INTERVAL);
        tick.tick().await; // immediate first tick carries no work
        while running.load(Ordering::Acquire) {
            tick.tick().await;
            let removed = registry.prune();
            if removed > 0 {
                debug!(removed, remaining = registry.len(), "pruned orphaned replays");
            }
        }
    })
}

/// Accept loop of the loopback replay listener.
pub(crate) async fn serve_replay_listener(
    listener: TcpListener,
    registry: Arc<ReplayRegistry>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::Acquire) {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "replay listener accept failed");
                continue;
            }
        };
        debug!(peer = %peer, "replay connection accepted");

        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let registry = Arc::clone(&registry);
                async move { Ok::<_, Infallible>(handle_replay_request(&registry, req)) }
            });

            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(socket), service)
                .await
            {
                debug!(error = %e, "replay connection ended with error");
            }
        });
    }
}

/// Serve `GET /replay/<message_id>`: atomically claim the replay and
/// stream its queue, applying the snapshot status and headers first.
pub(crate) fn handle_replay_request<B>(
    registry: &ReplayRegistry,
    req: Request<B>,
) -> Response<ProxyBody> {
    let path = req.uri().path();
    let message_id = match path
        .strip_prefix("/replay/")
        .and_then(|rest| rest.parse::<u32>().ok())
    {
        Some(id) => id,
        None => {
            return Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(empty_body())
                .expect("static response");
        }
    };

    let replay = match registry.take(message_id) {
        Some(replay) => replay,
        None => {
            debug!(message_id, "replay not found or already claimed");
            return Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(empty_body())
                .expect("static response");
        }
    };

    let info = replay.message_info();
    let mut builder = Response::builder().status(info.status);
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in info.headers.iter() {
            headers.append(name.clone(), value.clone());
        }
    }

    let body = stream_body(replay_body_stream(replay));
    builder.body(body).unwrap_or_else(|_| {
        Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(empty_body())
            .expect("static response")
    })
}

/// Drain the replay queue as a body stream: chunks in source order, a
/// 10 ms nap when the queue runs dry, terminating once the source signals
/// completion (or either side aborts).
fn replay_body_stream(
    replay: Arc<ResponseReplay>,
) -> impl futures::Stream<Item = Result<Bytes, std::io::Error>> {
    futures::stream::unfold(replay, |replay| async move {
        loop {
            if replay.replay_aborted() {
                return None;
            }
            if let Some(chunk) = replay.next_chunk() {
                return Some((Ok(chunk), replay));
            }
            if (replay.body_complete() || replay.source_aborted()) && replay.queue_is_empty() {
                return None;
            }
            tokio::time::sleep(DRAIN_IDLE_WAIT).await;
        }
    })
}
