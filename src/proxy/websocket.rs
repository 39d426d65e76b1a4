//! WebSocket bridge
//!
//! Rebuilds the upgrade per hop: a fresh client handshake toward the
//! upstream (carrying cookies, subprotocols and every non-forbidden
//! header), then the downstream 101 with the negotiated subprotocol
//! propagated back. Two pumps forward frames per direction, optionally
//! pushing each text/binary frame through whole-body inspection with the
//! usual allow/drop semantics.

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use http::{header, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use crate::config::ProxyHandler;
use crate::engine::ProxyCore;
use crate::headers::{should_copy, FilterScope};
use crate::message::{MessageInfo, MessageProtocol, ProxyNextAction};
use crate::proxy::http::TransactionError;
use crate::proxy::{empty_body, ConnectionInfo, ProxyBody};

/// Handle a websocket upgrade request end to end. Returns the 101 for
/// the client; the frame pumps run on a spawned task once the connection
/// is released by the HTTP layer.
pub(crate) async fn handle_upgrade(
    core: Arc<ProxyCore>,
    conn: ConnectionInfo,
    mut req: Request<Incoming>,
) -> Result<Response<ProxyBody>, TransactionError> {
    let authority = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| conn.sni.clone())
        .ok_or(TransactionError::BadRequest("upgrade carries no Host"))?;

    let scheme = if conn.encrypted { "wss" } else { "ws" };
    let target = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = Url::parse(&format!("{scheme}://{authority}{target}"))
        .map_err(|_| TransactionError::BadRequest("unparseable upgrade target"))?;

    let client_key = req
        .headers()
        .get("sec-websocket-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .filter(|k| !k.is_empty())
        .ok_or(TransactionError::UpgradeFailed(
            "missing Sec-WebSocket-Key".to_string(),
        ))?;

    let mut info = MessageInfo::request(
        url.clone(),
        req.method().clone(),
        req.version(),
        req.headers().clone(),
        MessageProtocol::WebSocket,
        conn.encrypted,
        conn.local,
        conn.peer,
    );

    core.handler.message_begin(&mut info).await;
    debug!(
        message_id = info.message_id,
        url = %url,
        action = ?info.next_action,
        "websocket upgrade announced"
    );

    if info.next_action == ProxyNextAction::DropConnection {
        core.stats.record_dropped();
        // Complete the downstream handshake, then close it gracefully.
        let accept = derive_accept_key(client_key.as_bytes());
        let upgrade = hyper::upgrade::on(&mut req);
        tokio::spawn(async move {
            if let Ok(upgraded) = upgrade.await {
                let mut downstream = WebSocketStream::from_raw_socket(
                    TokioIo::new(upgraded),
                    Role::Server,
                    None,
                )
                .await;
                let _ = downstream.send(Message::Close(None)).await;
                let _ = downstream.close(None).await;
            }
        });
        return switching_protocols(&accept, None);
    }

    let frame_inspection = !matches!(
        info.next_action,
        ProxyNextAction::AllowAndIgnoreContent | ProxyNextAction::AllowAndIgnoreContentAndResponse
    );

    // Fresh client handshake toward the upstream. The websocket forbidden
    // set strips the downstream handshake headers; cookies and the
    // subprotocol list are carried over explicitly.
    let mut builder = Request::builder()
        .uri(url.as_str())
        .header(header::HOST, authority.clone())
        .header(header::UPGRADE, "websocket")
        .header(header::CONNECTION, "Upgrade");
    for (name, value) in info.headers.iter() {
        if name == header::HOST {
            continue;
        }
        if should_copy(name, FilterScope::WebSocket, &info.exempted_headers) {
            builder = builder.header(name, value);
        }
    }
    if let Some(cookie) = req.headers().get(header::COOKIE) {
        builder = builder.header(header::COOKIE, cookie);
    }
    if let Some(protocols) = req.headers().get("sec-websocket-protocol") {
        builder = builder.header("sec-websocket-protocol", protocols);
    }
    let upstream_request = builder
        .body(())
        .map_err(|e| TransactionError::UpgradeFailed(e.to_string()))?;

    let (upstream_ws, upstream_response) =
        connect_async(upstream_request).await.map_err(|e| {
            warn!(url = %url, error = %e, "upstream websocket handshake failed");
            TransactionError::UpgradeFailed(e.to_string())
        })?;

    let negotiated = upstream_response
        .headers()
        .get("sec-websocket-protocol")
        .cloned();

    // Frame records: client->server frames inherit the request record,
    // server->client frames the response record.
    let request_info = Arc::new(info);
    let response_info = Arc::new(MessageInfo::response(
        Arc::clone(&request_info),
        StatusCode::SWITCHING_PROTOCOLS,
        request_info.http_version,
        http::HeaderMap::new(),
    ));

    let accept = derive_accept_key(client_key.as_bytes());
    let upgrade = hyper::upgrade::on(&mut req);
    let handler = Arc::clone(&core.handler);
    let core_for_task = Arc::clone(&core);

    tokio::spawn(async move {
        let upgraded = match upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                debug!(error = %e, "downstream upgrade never completed");
                let (mut tx, _) = upstream_ws.split();
                let _ = tx.close().await;
                return;
            }
        };

        let downstream =
            WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
        core_for_task.stats.record_websocket();
        debug!(message_id = request_info.message_id, "websocket bridge established");

        let (down_tx, down_rx) = downstream.split();
        let (up_tx, up_rx) = upstream_ws.split();

        let client_to_server = pump(
            down_rx,
            up_tx,
            frame_inspection,
            Arc::clone(&handler),
            Arc::clone(&request_info),
        );
        let server_to_client = pump(
            up_rx,
            down_tx,
            frame_inspection,
            handler,
            response_info,
        );

        tokio::join!(client_to_server, server_to_client);
        debug!(message_id = request_info.message_id, "websocket bridge closed");
    });

    switching_protocols(&accept, negotiated)
}

fn switching_protocols(
    accept_key: &str,
    subprotocol: Option<http::HeaderValue>,
) -> Result<Response<ProxyBody>, TransactionError> {
    let mut builder = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::UPGRADE, "websocket")
        .header(header::CONNECTION, "Upgrade")
        .header("sec-websocket-accept", accept_key);
    if let Some(protocol) = subprotocol {
        builder = builder.header("sec-websocket-protocol", protocol);
    }
    builder
        .body(empty_body())
        .map_err(|e| TransactionError::UpgradeFailed(e.to_string()))
}

/// Forward frames from `rx` to `tx`, optionally inspecting text and
/// binary payloads. Close frames are forwarded with their code and reason
/// and end the pump; on any error the opposite side is closed
/// best-effort.
async fn pump<R, W>(
    mut rx: R,
    mut tx: W,
    inspect: bool,
    handler: Arc<dyn ProxyHandler>,
    base: Arc<MessageInfo>,
) where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
    W: Sink<Message, Error = WsError> + Unpin,
{
    while let Some(next) = rx.next().await {
        let message = match next {
            Ok(message) => message,
            Err(e) => {
                debug!(message_id = base.message_id, error = %e, "websocket receive error");
                break;
            }
        };

        let outgoing = match message {
            Message::Text(text) if inspect => {
                match inspect_frame(&handler, &base, Bytes::from(text.clone().into_bytes()), "text/plain")
                    .await
                {
                    FrameVerdict::Drop => {
                        let _ = tx.send(Message::Close(None)).await;
                        break;
                    }
                    FrameVerdict::Forward(body) => match String::from_utf8(body.to_vec()) {
                        Ok(mutated) => Message::Text(mutated),
                        Err(_) => Message::Text(text),
                    },
                }
            }
            Message::Binary(data) if inspect => {
                match inspect_frame(
                    &handler,
                    &base,
                    Bytes::from(data),
                    "application/octet-stream",
                )
                .await
                {
                    FrameVerdict::Drop => {
                        let _ = tx.send(Message::Close(None)).await;
                        break;
                    }
                    FrameVerdict::Forward(body) => Message::Binary(body.to_vec()),
                }
            }
            Message::Close(frame) => {
                debug!(message_id = base.message_id, "forwarding close frame");
                let _ = tx.send(Message::Close(frame)).await;
                break;
            }
            other => other,
        };

        if let Err(e) = tx.send(outgoing).await {
            debug!(message_id = base.message_id, error = %e, "websocket forward error");
            break;
        }
    }

    let _ = tx.close().await;
}

enum FrameVerdict {
    Forward(Bytes),
    Drop,
}

/// Run one frame through whole-body inspection on a per-frame copy of
/// the transaction record.
async fn inspect_frame(
    handler: &Arc<dyn ProxyHandler>,
    base: &Arc<MessageInfo>,
    payload: Bytes,
    content_type: &str,
) -> FrameVerdict {
    let mut frame_info = (**base).clone();
    frame_info.set_body_internal(payload, Some(content_type));
    frame_info.next_action = ProxyNextAction::AllowAndIgnoreContent;

    handler.whole_body_inspection(&mut frame_info).await;

    if frame_info.next_action == ProxyNextAction::DropConnection {
        FrameVerdict::Drop
    } else {
        FrameVerdict::Forward(frame_info.body().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use http::{HeaderMap, Method, Version};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn base_info() -> Arc<MessageInfo> {
        Arc::new(MessageInfo::request(
            Url::parse("wss://echo.test/socket").unwrap(),
            Method::GET,
            Version::HTTP_11,
            HeaderMap::new(),
            MessageProtocol::WebSocket,
            true,
            MessageInfo::unspecified_addr(),
            MessageInfo::unspecified_addr(),
        ))
    }

    struct FrameRecorder {
        frames: AtomicUsize,
        content_types: parking_lot::Mutex<Vec<String>>,
        drop_on: Option<usize>,
    }

    impl FrameRecorder {
        fn new(drop_on: Option<usize>) -> Arc<Self> {
            Arc::new(Self {
                frames: AtomicUsize::new(0),
                content_types: parking_lot::Mutex::new(Vec::new()),
                drop_on,
            })
        }
    }

    #[async_trait]
    impl ProxyHandler for FrameRecorder {
        async fn whole_body_inspection(&self, info: &mut MessageInfo) {
            let seen = self.frames.fetch_add(1, Ordering::SeqCst) + 1;
            self.content_types.lock().push(info.body_content_type.clone());
            if Some(seen) == self.drop_on {
                info.next_action = ProxyNextAction::DropConnection;
            }
        }
    }

    #[tokio::test]
    async fn test_inspect_frame_sets_content_type() {
        let recorder = FrameRecorder::new(None);
        let handler: Arc<dyn ProxyHandler> = recorder.clone();

        let verdict = inspect_frame(
            &handler,
            &base_info(),
            Bytes::from_static(b"hello"),
            "text/plain",
        )
        .await;
        assert!(matches!(verdict, FrameVerdict::Forward(b) if b == "hello"));

        let verdict = inspect_frame(
            &handler,
            &base_info(),
            Bytes::from_static(&[1, 2, 3]),
            "application/octet-stream",
        )
        .await;
        assert!(matches!(verdict, FrameVerdict::Forward(_)));

        let types = recorder.content_types.lock().clone();
        assert_eq!(types, vec!["text/plain", "application/octet-stream"]);
    }

    #[tokio::test]
    async fn test_inspect_frame_honours_drop() {
        let recorder = FrameRecorder::new(Some(1));
        let handler: Arc<dyn ProxyHandler> = recorder.clone();

        let verdict = inspect_frame(
            &handler,
            &base_info(),
            Bytes::from_static(b"payload"),
            "text/plain",
        )
        .await;
        assert!(matches!(verdict, FrameVerdict::Drop));
    }

    #[tokio::test]
    async fn test_pump_forwards_and_inspects_frames() {
        let recorder = FrameRecorder::new(None);
        let handler: Arc<dyn ProxyHandler> = recorder.clone();

        let incoming = futures::stream::iter(vec![
            Ok(Message::Text("one".to_string())),
            Ok(Message::Binary(vec![7, 8])),
            Ok(Message::Ping(vec![])),
            Ok(Message::Close(None)),
        ]);
        let (tx, rx) = futures::channel::mpsc::unbounded::<Message>();
        let sink = tx.sink_map_err(|_| WsError::ConnectionClosed);

        pump(incoming, sink, true, handler, base_info()).await;

        let forwarded: Vec<Message> = rx.collect().await;
        // Text, binary and ping forwarded, close forwarded last.
        assert_eq!(forwarded.len(), 4);
        assert!(matches!(&forwarded[0], Message::Text(t) if t.as_str() == "one"));
        assert!(matches!(&forwarded[1], Message::Binary(b) if b.as_slice() == [7, 8]));
        assert!(matches!(forwarded[3], Message::Close(None)));
        // Ping frames bypass inspection.
        assert_eq!(recorder.frames.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_pump_drop_terminates_with_close() {
        let recorder = FrameRecorder::new(Some(2));
        let handler: Arc<dyn ProxyHandler> = recorder.clone();

        let incoming = futures::stream::iter(vec![
            Ok(Message::Text("keep".to_string())),
            Ok(Message::Text("drop-me".to_string())),
            Ok(Message::Text("never-seen".to_string())),
        ]);
        let (tx, rx) = futures::channel::mpsc::unbounded::<Message>();
        let sink = tx.sink_map_err(|_| WsError::ConnectionClosed);

        pump(incoming, sink, true, handler, base_info()).await;

        let forwarded: Vec<Message> = rx.collect().await;
        assert_eq!(forwarded.len(), 2);
        assert!(matches!(&forwarded[0], Message::Text(t) if t.as_str() == "keep"));
        assert!(matches!(forwarded[1], Message::Close(None)));
        assert_eq!(recorder.frames.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_pump_inspection_disabled_skips_callback() {
        let recorder = FrameRecorder::new(None);
        let handler: Arc<dyn ProxyHandler> = recorder.clone();

        let incoming = futures::stream::iter(vec![
            Ok(Message::Text("untouched".to_string())),
            Ok(Message::Close(None)),
        ]);
        let (tx, rx) = futures::channel::mpsc::unbounded::<Message>();
        let sink = tx.sink_map_err(|_| WsError::ConnectionClosed);

        pump(incoming, sink, false, handler, base_info()).await;

        let forwarded: Vec<Message> = rx.collect().await;
        assert_eq!(forwarded.len(), 2);
        assert_eq!(recorder.frames.load(Ordering::SeqCst), 0);
    }
}
