//! HTTP transaction handler
//!
//! The per-request state machine. A parsed client request is announced to
//! the host, the returned `ProxyNextAction` picks one of five handling
//! modes (pass-through, buffered inspection, streamed inspection,
//! delegation, drop), the upstream exchange happens through the
//! configured client, and the response runs the same machine with replay
//! as the extra response-only mode.

use bytes::Bytes;
use futures::TryStreamExt;
use http::{header, request, Request, Response, StatusCode, Version};
use hyper::body::Incoming;
use http_body_util::BodyExt;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};
use url::Url;

use crate::engine::ProxyCore;
use crate::headers::{should_copy, FilterScope};
use crate::message::{MessageInfo, MessageProtocol, ProxyNextAction};
use crate::proxy::body::{collect_capped, MAX_BODY_BUFFER_BYTES};
use crate::proxy::inspection::{inspected_stream, replay_tap_stream};
use crate::proxy::{empty_body, full_body, stream_body, ConnectionInfo, ProxyBody};
use crate::replay::{ReplayControl, ResponseReplay};

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("malformed client request: {0}")]
    BadRequest(&'static str),

    #[error("failed to read client body: {0}")]
    ClientBodyFailed(String),

    #[error("upstream send failed: {0}")]
    UpstreamSendFailed(String),

    #[error("upstream read failed: {0}")]
    UpstreamReadFailed(String),

    #[error("websocket upgrade failed: {0}")]
    UpgradeFailed(String),
}

/// Run one HTTP transaction end to end.
pub(crate) async fn handle_transaction(
    core: Arc<ProxyCore>,
    conn: ConnectionInfo,
    req: Request<Incoming>,
) -> Result<Response<ProxyBody>, TransactionError> {
    core.stats.record_transaction();

    let (parts, client_body) = req.into_parts();
    let url = absolute_url(&conn, &parts)?;
    let original_host = parts.headers.get(header::HOST).cloned();

    let mut info = MessageInfo::request(
        url,
        parts.method.clone(),
        parts.version,
        parts.headers.clone(),
        MessageProtocol::Http,
        conn.encrypted,
        conn.local,
        conn.peer,
    );

    core.handler.message_begin(&mut info).await;
    debug!(
        message_id = info.message_id,
        method = %info.method,
        url = %info.url,
        action = ?info.next_action,
        "request announced"
    );

    match info.next_action {
        ProxyNextAction::DropConnection => {
            core.stats.record_dropped();
            return Ok(synthesize_drop_response(&mut info));
        }
        ProxyNextAction::AllowButDelegateHandler => {
            let response = core.handler.external_request(&info).await;
            return Ok(convert_external_response(response));
        }
        _ => {}
    }

    let request_action = info.next_action;
    let client = info
        .fulfillment_client
        .clone()
        .unwrap_or_else(|| core.default_client.clone());

    // Body strategy per action. The record is frozen once no callback can
    // mutate it anymore; streamed taps borrow the frozen view.
    let declared_body = body_declared(&info.headers);
    let content_length_zero = info
        .headers
        .get(header::CONTENT_LENGTH)
        .map(|v| v.as_bytes() == b"0")
        .unwrap_or(false);

    let request_info: Arc<MessageInfo>;
    let upstream_body: Option<reqwest::Body>;

    match request_action {
        ProxyNextAction::AllowButRequestContentInspection => {
            let collected = collect_capped(
                client_body.into_data_stream().map_err(to_io_error),
                MAX_BODY_BUFFER_BYTES,
            )
            .await
            .map_err(|e| TransactionError::ClientBodyFailed(e.to_string()))?;

            let content_type = header_str(&info.headers, &header::CONTENT_TYPE);
            info.set_body_internal(collected.bytes, content_type.as_deref());

            core.handler.whole_body_inspection(&mut info).await;
            if info.next_action == ProxyNextAction::DropConnection {
                core.stats.record_dropped();
                return Ok(synthesize_drop_response(&mut info));
            }

            let body = info.body().clone();
            request_info = Arc::new(info);
            // Exact Content-Length comes from the sized body.
            upstream_body = Some(reqwest::Body::from(body));
        }
        ProxyNextAction::AllowButRequestStreamedContentInspection => {
            request_info = Arc::new(info);
            let tapped = inspected_stream(
                client_body.into_data_stream().map_err(to_io_error),
                Arc::clone(&request_info),
                Arc::clone(&core.handler),
            );
            upstream_body = Some(reqwest::Body::wrap_stream(tapped));
        }
        _ => {
            request_info = Arc::new(info);
            upstream_body = if declared_body {
                Some(reqwest::Body::wrap_stream(
                    client_body.into_data_stream().map_err(to_io_error),
                ))
            } else if content_length_zero {
                // A declared empty body stays a declared empty body.
                Some(reqwest::Body::from(Bytes::new()))
            } else {
                None
            };
        }
    }

    let upstream_headers = filtered_upstream_headers(&request_info, original_host);

    let mut builder = client
        .request(request_info.method.clone(), request_info.url.clone())
        .version(cap_version(request_info.http_version))
        .headers(upstream_headers);
    if let Some(body) = upstream_body {
        builder = builder.body(body);
    }

    let upstream = builder.send().await.map_err(|e| {
        error!(
            message_id = request_info.message_id,
            url = %request_info.url,
            error = %e,
            "upstream send failed"
        );
        TransactionError::UpstreamSendFailed(e.to_string())
    })?;

    handle_response(core, request_info, request_action, upstream).await
}

/// Response half of the machine, entered once upstream headers arrived.
async fn handle_response(
    core: Arc<ProxyCore>,
    request_info: Arc<MessageInfo>,
    request_action: ProxyNextAction,
    upstream: reqwest::Response,
) -> Result<Response<ProxyBody>, TransactionError> {
    let status = upstream.status();
    let version = upstream.version();

    let mut response_headers = http::HeaderMap::new();
    for (name, value) in upstream.headers() {
        if should_copy(name, FilterScope::Http, &request_info.exempted_headers) {
            response_headers.append(name.clone(), value.clone());
        }
    }

    let mut response_info =
        MessageInfo::response(Arc::clone(&request_info), status, version, response_headers);

    // The request side opted out of every further callback.
    if request_action == ProxyNextAction::AllowAndIgnoreContentAndResponse {
        let response_info = Arc::new(response_info);
        let body = upstream.bytes_stream().map_err(to_io_error);
        return finish_response(&request_info, &response_info, BodySource::stream(body)).await;
    }

    core.handler.message_begin(&mut response_info).await;
    debug!(
        message_id = response_info.message_id,
        status = %response_info.status,
        action = ?response_info.next_action,
        "response announced"
    );

    match response_info.next_action {
        ProxyNextAction::DropConnection => {
            core.stats.record_dropped();
            Ok(synthesize_drop_response(&mut response_info))
        }
        ProxyNextAction::AllowButDelegateHandler => {
            let response = core.handler.external_request(&response_info).await;
            Ok(convert_external_response(response))
        }
        ProxyNextAction::AllowButRequestContentInspection => {
            let collected = collect_capped(
                Box::pin(upstream.bytes_stream().map_err(to_io_error)),
                MAX_BODY_BUFFER_BYTES,
            )
            .await
            .map_err(|e| TransactionError::UpstreamReadFailed(e.to_string()))?;

            let content_type = header_str(&response_info.headers, &header::CONTENT_TYPE);
            response_info.set_body_internal(collected.bytes, content_type.as_deref());

            core.handler.whole_body_inspection(&mut response_info).await;
            if response_info.next_action == ProxyNextAction::DropConnection {
                core.stats.record_dropped();
                return Ok(synthesize_drop_response(&mut response_info));
            }

            let body = response_info.body().clone();
            let response_info = Arc::new(response_info);
            finish_response(&request_info, &response_info, BodySource::Buffered(body)).await
        }
        ProxyNextAction::AllowButRequestStreamedContentInspection => {
            let response_info = Arc::new(response_info);
            let tapped = inspected_stream(
                upstream.bytes_stream().map_err(to_io_error),
                Arc::clone(&response_info),
                Arc::clone(&core.handler),
            );
            finish_response(&request_info, &response_info, BodySource::stream(tapped)).await
        }
        ProxyNextAction::AllowButRequestResponseReplay => {
            let response_info = Arc::new(response_info);
            let replay = Arc::new(ResponseReplay::new(
                Arc::clone(&response_info),
                core.replay_port(),
            ));
            core.replays.insert(Arc::clone(&replay));
            core.stats.record_replay();

            core.handler
                .replay_inspection(&response_info, ReplayControl::new(Arc::clone(&replay)))
                .await;

            let tapped = replay_tap_stream(
                upstream.bytes_stream().map_err(to_io_error),
                replay,
                Arc::clone(&core.replays),
            );
            finish_response(&request_info, &response_info, BodySource::stream(tapped)).await
        }
        ProxyNextAction::AllowAndIgnoreContent
        | ProxyNextAction::AllowAndIgnoreContentAndResponse => {
            let response_info = Arc::new(response_info);
            let body = upstream.bytes_stream().map_err(to_io_error);
            finish_response(&request_info, &response_info, BodySource::stream(body)).await
        }
    }
}

enum BodySource {
    Buffered(Bytes),
    Stream(futures::stream::BoxStream<'static, Result<Bytes, io::Error>>),
}

impl BodySource {
    fn stream<S>(stream: S) -> Self
    where
        S: futures::Stream<Item = Result<Bytes, io::Error>> + Send + 'static,
    {
        BodySource::Stream(Box::pin(stream))
    }
}

/// Frame the response for the client: statuses without bodies never get
/// one, HTTP/1.0 clients get a fully buffered body so an exact
/// Content-Length can be emitted, everyone else streams.
async fn finish_response(
    request_info: &MessageInfo,
    response_info: &MessageInfo,
    source: BodySource,
) -> Result<Response<ProxyBody>, TransactionError> {
    let body = if status_forbids_body(response_info.status) {
        empty_body()
    } else {
        match source {
            BodySource::Buffered(bytes) => full_body(bytes),
            BodySource::Stream(stream) => {
                if request_info.http_version <= Version::HTTP_10 {
                    let collected = collect_capped(stream, MAX_BODY_BUFFER_BYTES)
                        .await
                        .map_err(|e| TransactionError::UpstreamReadFailed(e.to_string()))?;
                    full_body(collected.bytes)
                } else {
                    stream_body(stream)
                }
            }
        }
    };

    let mut builder = Response::builder().status(response_info.status);
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in response_info.headers.iter() {
            headers.append(name.clone(), value.clone());
        }
    }

    builder
        .body(body)
        .map_err(|e| TransactionError::UpstreamReadFailed(e.to_string()))
}

/// Build the synthetic answer for a dropped transaction: the
/// host-populated body and status when one was assigned, a 204 otherwise.
pub(crate) fn synthesize_drop_response(info: &mut MessageInfo) -> Response<ProxyBody> {
    if info.body_is_user_created() && !info.body().is_empty() {
        info.direction = crate::message::MessageDirection::Response;
        let mut builder = Response::builder().status(info.status);
        if let Some(headers) = builder.headers_mut() {
            for (name, value) in info.headers.iter() {
                headers.append(name.clone(), value.clone());
            }
            if !info.body_content_type.is_empty() && !headers.contains_key(header::CONTENT_TYPE) {
                if let Ok(value) = http::HeaderValue::from_str(&info.body_content_type) {
                    headers.insert(header::CONTENT_TYPE, value);
                }
            }
        }
        builder
            .body(full_body(info.body().clone()))
            .unwrap_or_else(|_| fallback_204())
    } else {
        info.make_204_no_content();
        let mut builder = Response::builder().status(info.status);
        if let Some(headers) = builder.headers_mut() {
            for (name, value) in info.headers.iter() {
                headers.append(name.clone(), value.clone());
            }
        }
        builder.body(empty_body()).unwrap_or_else(|_| fallback_204())
    }
}

fn fallback_204() -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(empty_body())
        .expect("static response")
}

fn convert_external_response(response: http::Response<Bytes>) -> Response<ProxyBody> {
    let (parts, body) = response.into_parts();
    Response::from_parts(parts, full_body(body))
}

/// Compute the absolute URL from the wire-format request target, keeping
/// its percent-encoding, with scheme and authority taken from the
/// connection rather than any reparse.
fn absolute_url(
    conn: &ConnectionInfo,
    parts: &request::Parts,
) -> Result<Url, TransactionError> {
    let scheme = if conn.encrypted { "https" } else { "http" };
    let authority = parts
        .headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| conn.sni.clone())
        .ok_or(TransactionError::BadRequest("request carries no Host"))?;

    let target = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    Url::parse(&format!("{scheme}://{authority}{target}"))
        .map_err(|_| TransactionError::BadRequest("unparseable request target"))
}

/// Copy request headers minus the forbidden set, then pin `Host` to the
/// value the client sent.
fn filtered_upstream_headers(
    info: &MessageInfo,
    original_host: Option<http::HeaderValue>,
) -> http::HeaderMap {
    let mut headers = http::HeaderMap::new();
    for (name, value) in info.headers.iter() {
        if name == header::HOST {
            continue;
        }
        if should_copy(name, FilterScope::Http, &info.exempted_headers) {
            headers.append(name.clone(), value.clone());
        }
    }
    if let Some(host) = original_host {
        headers.insert(header::HOST, host);
    }
    headers
}

fn body_declared(headers: &http::HeaderMap) -> bool {
    let declared_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(|len| len > 0)
        .unwrap_or(false);
    declared_length || headers.contains_key(header::TRANSFER_ENCODING)
}

/// Mirror the client's version upstream, capped at HTTP/1.1.
fn cap_version(version: Version) -> Version {
    if version > Version::HTTP_11 {
        Version::HTTP_11
    } else {
        version
    }
}

/// 1xx, 204 and 304 responses never carry a body, inspected or not.
fn status_forbids_body(status: StatusCode) -> bool {
    status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

fn to_io_error<E>(e: E) -> io::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    io::Error::new(io::ErrorKind::Other, e)
}

fn header_str(headers: &http::HeaderMap, name: &header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
