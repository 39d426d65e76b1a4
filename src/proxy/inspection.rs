//! Inspection stream wrappers
//!
//! Two taps over a body stream. The inspected variant invokes the host's
//! streamed-inspection callback per chunk and can be torn down by its
//! verdict; the replay variant duplicates chunks into a
//! [`ResponseReplay`] while the original keeps streaming. Both guarantee
//! their close-out side effect fires exactly once, including when the
//! consumer drops the stream mid-flight.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, warn};

use crate::config::{ProxyHandler, StreamEvent, StreamVerdict};
use crate::message::MessageInfo;
use crate::replay::{ReplayRegistry, ResponseReplay};

type ChunkResult = Result<Bytes, io::Error>;
type BoxChunkStream = Pin<Box<dyn Stream<Item = ChunkResult> + Send>>;

/// A body stream with an attached tap and a teardown guard.
pub(crate) struct TappedStream {
    inner: BoxChunkStream,
    _guard: TapGuard,
}

impl Stream for TappedStream {
    type Item = ChunkResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// Fires the close-out side effect if the stream was dropped before
/// running to completion.
struct TapGuard {
    finalized: Arc<AtomicBool>,
    cleanup: GuardCleanup,
}

enum GuardCleanup {
    Inspect {
        handler: Arc<dyn ProxyHandler>,
        info: Arc<MessageInfo>,
    },
    Replay {
        replay: Arc<ResponseReplay>,
    },
}

impl Drop for TapGuard {
    fn drop(&mut self) {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return;
        }
        match &self.cleanup {
            GuardCleanup::Inspect { handler, info } => {
                let handler = Arc::clone(handler);
                let info = Arc::clone(info);
                if let Ok(rt) = tokio::runtime::Handle::try_current() {
                    rt.spawn(async move {
                        let _ = handler.streamed_inspection(&info, StreamEvent::Closed).await;
                    });
                }
            }
            GuardCleanup::Replay { replay } => {
                debug!(
                    message_id = replay.message_id(),
                    "source stream dropped, flagging replay"
                );
                replay.mark_source_aborted();
            }
        }
    }
}

struct InspectState {
    source: BoxChunkStream,
    info: Arc<MessageInfo>,
    handler: Arc<dyn ProxyHandler>,
    finalized: Arc<AtomicBool>,
    done: bool,
}

async fn fire_close(
    finalized: &Arc<AtomicBool>,
    handler: &Arc<dyn ProxyHandler>,
    info: &Arc<MessageInfo>,
) {
    if !finalized.swap(true, Ordering::SeqCst) {
        let _ = handler.streamed_inspection(info, StreamEvent::Closed).await;
    }
}

/// Wrap `source` so every chunk passes through the host's streamed
/// inspection callback. A `Drop` verdict tears the stream down with an
/// error the consumer observes as an aborted body.
pub(crate) fn inspected_stream<S>(
    source: S,
    info: Arc<MessageInfo>,
    handler: Arc<dyn ProxyHandler>,
) -> TappedStream
where
    S: Stream<Item = ChunkResult> + Send + 'static,
{
    let finalized = Arc::new(AtomicBool::new(false));
    let guard = TapGuard {
        finalized: Arc::clone(&finalized),
        cleanup: GuardCleanup::Inspect {
            handler: Arc::clone(&handler),
            info: Arc::clone(&info),
        },
    };

    let state = InspectState {
        source: source.boxed(),
        info,
        handler,
        finalized,
        done: false,
    };

    let stream = futures::stream::unfold(state, |mut st| async move {
        if st.done {
            return None;
        }
        match st.source.next().await {
            Some(Ok(chunk)) => {
                let verdict = st
                    .handler
                    .streamed_inspection(&st.info, StreamEvent::Data(&chunk))
                    .await;
                match verdict {
                    StreamVerdict::Continue => Some((Ok(chunk), st)),
                    StreamVerdict::Drop => {
                        debug!(
                            message_id = st.info.message_id,
                            "inspection callback dropped the stream"
                        );
                        st.done = true;
                        fire_close(&st.finalized, &st.handler, &st.info).await;
                        Some((
                            Err(io::Error::new(
                                io::ErrorKind::Other,
                                "stream torn down by inspection",
                            )),
                            st,
                        ))
                    }
                }
            }
            Some(Err(e)) => {
                st.done = true;
                fire_close(&st.finalized, &st.handler, &st.info).await;
                Some((Err(e), st))
            }
            None => {
                fire_close(&st.finalized, &st.handler, &st.info).await;
                None
            }
        }
    });

    TappedStream {
        inner: Box::pin(stream),
        _guard: guard,
    }
}

struct ReplayState {
    source: BoxChunkStream,
    replay: Arc<ResponseReplay>,
    registry: Arc<ReplayRegistry>,
    finalized: Arc<AtomicBool>,
    tapping: bool,
    done: bool,
}

/// Wrap `source` so every chunk is duplicated into `replay` while
/// streaming through unchanged. An over-cap write abandons the replay but
/// leaves the original stream untouched; a host terminate with
/// `close_source_stream` aborts the original too.
pub(crate) fn replay_tap_stream<S>(
    source: S,
    replay: Arc<ResponseReplay>,
    registry: Arc<ReplayRegistry>,
) -> TappedStream
where
    S: Stream<Item = ChunkResult> + Send + 'static,
{
    let finalized = Arc::new(AtomicBool::new(false));
    let guard = TapGuard {
        finalized: Arc::clone(&finalized),
        cleanup: GuardCleanup::Replay {
            replay: Arc::clone(&replay),
        },
    };

    let state = ReplayState {
        source: source.boxed(),
        replay,
        registry,
        finalized,
        tapping: true,
        done: false,
    };

    let stream = futures::stream::unfold(state, |mut st| async move {
        if st.done {
            return None;
        }
        if st.replay.should_close_source() {
            st.done = true;
            st.finalized.store(true, Ordering::SeqCst);
            return Some((
                Err(io::Error::new(
                    io::ErrorKind::Other,
                    "source closed by replay termination",
                )),
                st,
            ));
        }
        match st.source.next().await {
            Some(Ok(chunk)) => {
                if st.tapping && !st.replay.replay_aborted() {
                    if !st.replay.write_body_bytes(chunk.clone()) {
                        warn!(
                            message_id = st.replay.message_id(),
                            "replay buffer cap exceeded, abandoning replay"
                        );
                        st.registry.remove(st.replay.message_id());
                        st.replay.mark_replay_aborted();
                        st.tapping = false;
                    }
                }
                Some((Ok(chunk), st))
            }
            Some(Err(e)) => {
                st.done = true;
                st.finalized.store(true, Ordering::SeqCst);
                st.replay.mark_source_aborted();
                Some((Err(e), st))
            }
            None => {
                st.finalized.store(true, Ordering::SeqCst);
                st.replay.mark_body_complete();
                None
            }
        }
    });

    TappedStream {
        inner: Box::pin(stream),
        _guard: guard,
    }
}
