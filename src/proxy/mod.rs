//! Request pipeline
//!
//! Dispatching, the HTTP transaction state machine, bounded body
//! buffering, inspection-stream wrappers and the websocket bridge.

pub mod body;
pub mod dispatcher;
pub mod http;
pub mod inspection;
pub mod websocket;

use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use std::net::SocketAddr;

pub use http::TransactionError;

/// Body type every proxied response is expressed as.
pub(crate) type ProxyBody = UnsyncBoxBody<Bytes, std::io::Error>;

/// Facts about the accepted connection shared with the pipeline.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionInfo {
    pub local: SocketAddr,
    pub peer: SocketAddr,
    /// True when the client side arrived over intercepted TLS.
    pub encrypted: bool,
    /// SNI the client advertised, when encrypted.
    pub sni: Option<String>,
    /// Whether the downstream peer presented a client certificate.
    /// Surfaced only; forwarding upstream is a declared future extension.
    #[allow(dead_code)]
    pub has_peer_certificate: bool,
}

pub(crate) fn empty_body() -> ProxyBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub(crate) fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes)
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub(crate) fn stream_body<S>(stream: S) -> ProxyBody
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static,
{
    StreamBody::new(stream.map_ok(Frame::data)).boxed_unsync()
}
