//! Bounded body buffering
//!
//! Whole-body inspection and HTTP/1.0 reframing need the entire body in
//! memory. Buffering is capped at 128 MiB per direction; hitting the cap
//! is not an error, the body is treated as complete at the cap so the
//! transaction still finishes deterministically.

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tracing::warn;

/// Per-direction in-memory buffering cap.
pub const MAX_BODY_BUFFER_BYTES: usize = 128 * 1024 * 1024;

/// Outcome of a capped collect.
#[derive(Debug)]
pub(crate) struct CollectedBody {
    pub bytes: Bytes,
    /// True when the cap was hit and the tail was discarded.
    pub truncated: bool,
}

/// Collect a chunk stream into one buffer, stopping at `cap` bytes.
pub(crate) async fn collect_capped<S, E>(mut stream: S, cap: usize) -> Result<CollectedBody, E>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    let mut collected = BytesMut::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if collected.len() + chunk.len() > cap {
            let room = cap - collected.len();
            collected.extend_from_slice(&chunk[..room]);
            warn!(
                buffered = collected.len(),
                cap, "body buffering cap reached, treating body as complete"
            );
            return Ok(CollectedBody {
                bytes: collected.freeze(),
                truncated: true,
            });
        }
        collected.extend_from_slice(&chunk);
    }

    Ok(CollectedBody {
        bytes: collected.freeze(),
        truncated: false,
    })
}
