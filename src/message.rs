//! Per-transaction message record
//!
//! [`MessageInfo`] is the canonical descriptor handed to every host
//! callback. A request and its response share one `message_id`; the
//! response carries a frozen, non-owning view of the request record.

use bytes::Bytes;
use chrono::{TimeZone, Utc};
use http::header::{HeaderName, EXPIRES, LOCATION};
use http::{HeaderMap, HeaderValue, Method, StatusCode, Version};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use url::Url;

/// Process-wide message id source. Wraps on overflow; a request/response
/// pair always shares one value.
static NEXT_MESSAGE_ID: AtomicU32 = AtomicU32::new(1);

pub(crate) fn next_message_id() -> u32 {
    NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Whether a message travels toward the upstream server or back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    Request,
    Response,
}

/// Application protocol the message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageProtocol {
    Http,
    WebSocket,
}

/// Instruction returned by host callbacks that drives the transaction
/// state machine. See the crate docs for the full transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyNextAction {
    /// Forward unmodified; skip the content callback but still announce
    /// the response.
    #[default]
    AllowAndIgnoreContent,
    /// Forward unmodified and invoke no further callback for this
    /// transaction, not even response-begin.
    AllowAndIgnoreContentAndResponse,
    /// Buffer the whole body (bounded), then run whole-body inspection.
    AllowButRequestContentInspection,
    /// Forward the body through an inspection stream invoking the chunk
    /// callback as data flows.
    AllowButRequestStreamedContentInspection,
    /// Response side only: stream normally while duplicating bytes into a
    /// replay served from the loopback listener.
    AllowButRequestResponseReplay,
    /// Hand the whole transaction to the host's external handler.
    AllowButDelegateHandler,
    /// Close immediately, answering with the host-populated body/status or
    /// a synthesized 204.
    DropConnection,
}

/// Canonical per-transaction record shared with host callbacks.
///
/// Mutating accessors are deliberately explicit: the public body setter
/// marks the body as user-created, which the pipeline uses to decide
/// whether a drop carries a custom payload.
#[derive(Debug, Clone)]
pub struct MessageInfo {
    /// Shared by the request and its response.
    pub message_id: u32,
    /// Absolute URL including scheme, host and query.
    pub url: Url,
    /// Request side only; defaults to GET on responses.
    pub method: Method,
    /// Response side only; defaults to 200 on requests.
    pub status: StatusCode,
    /// Protocol version parsed from the client request. The upstream
    /// request mirrors it, capped at HTTP/1.1.
    pub http_version: Version,
    /// Ordered, case-insensitive multimap. Values are opaque; the proxy
    /// never splits them on commas.
    pub headers: HeaderMap,
    /// Header names that bypass the forbidden-header filter for this
    /// transaction.
    pub exempted_headers: HashSet<HeaderName>,
    body: Bytes,
    body_is_user_created: bool,
    /// MIME type associated with `body`.
    pub body_content_type: String,
    pub protocol: MessageProtocol,
    pub direction: MessageDirection,
    /// True when the client side arrived over TLS.
    pub is_encrypted: bool,
    pub local_address: IpAddr,
    pub local_port: u16,
    pub remote_address: IpAddr,
    pub remote_port: u16,
    /// Set by host callbacks to steer the transaction.
    pub next_action: ProxyNextAction,
    /// Replaces the default upstream client for this request only.
    pub fulfillment_client: Option<reqwest::Client>,
    /// On a response, the frozen request record. Absent on requests.
    pub originating_message: Option<Arc<MessageInfo>>,
}

impl MessageInfo {
    /// Build a request-side record. The message id is allocated here and
    /// later inherited by the response.
    pub(crate) fn request(
        url: Url,
        method: Method,
        http_version: Version,
        headers: HeaderMap,
        protocol: MessageProtocol,
        is_encrypted: bool,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> Self {
        Self {
            message_id: next_message_id(),
            url,
            method,
            status: StatusCode::OK,
            http_version,
            headers,
            exempted_headers: HashSet::new(),
            body: Bytes::new(),
            body_is_user_created: false,
            body_content_type: String::new(),
            protocol,
            direction: MessageDirection::Request,
            is_encrypted,
            local_address: local.ip(),
            local_port: local.port(),
            remote_address: remote.ip(),
            remote_port: remote.port(),
            next_action: ProxyNextAction::AllowAndIgnoreContent,
            fulfillment_client: None,
            originating_message: None,
        }
    }

    /// Build the response-side record for a frozen request. Shares the
    /// request's id and back-references it.
    pub(crate) fn response(
        originating: Arc<MessageInfo>,
        status: StatusCode,
        http_version: Version,
        headers: HeaderMap,
    ) -> Self {
        Self {
            message_id: originating.message_id,
            url: originating.url.clone(),
            method: originating.method.clone(),
            status,
            http_version,
            headers,
            exempted_headers: originating.exempted_headers.clone(),
            body: Bytes::new(),
            body_is_user_created: false,
            body_content_type: String::new(),
            protocol: originating.protocol,
            direction: MessageDirection::Response,
            is_encrypted: originating.is_encrypted,
            local_address: originating.local_address,
            local_port: originating.local_port,
            remote_address: originating.remote_address,
            remote_port: originating.remote_port,
            next_action: ProxyNextAction::AllowAndIgnoreContent,
            fulfillment_client: None,
            originating_message: Some(originating),
        }
    }

    /// Current body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// True when the host assigned the body through the public setter.
    pub fn body_is_user_created(&self) -> bool {
        self.body_is_user_created
    }

    /// Copy `count` bytes from `bytes` starting at `offset` into an owned
    /// buffer, mark the body user-created, and record its content type.
    pub fn copy_and_set_body(
        &mut self,
        bytes: &[u8],
        offset: usize,
        count: usize,
        content_type: &str,
    ) {
        let end = offset.saturating_add(count).min(bytes.len());
        let start = offset.min(end);
        self.body = Bytes::copy_from_slice(&bytes[start..end]);
        self.body_is_user_created = true;
        self.body_content_type = content_type.to_string();
    }

    /// Internal body assignment used while buffering traffic. Does not
    /// flip the user-created flag.
    pub(crate) fn set_body_internal(&mut self, body: Bytes, content_type: Option<&str>) {
        self.body = body;
        if let Some(ct) = content_type {
            self.body_content_type = ct.to_string();
        }
    }

    /// Turn this record into a 204 No Content response: headers cleared,
    /// body emptied, `Expires` pinned to the Unix epoch so nothing caches
    /// the synthetic answer.
    pub fn make_204_no_content(&mut self) {
        self.headers.clear();
        self.status = StatusCode::NO_CONTENT;
        self.direction = MessageDirection::Response;
        self.body = Bytes::new();
        self.body_is_user_created = false;
        self.headers.insert(EXPIRES, epoch_expires());
    }

    /// Turn this record into a 302 redirect to `location`.
    pub fn make_temporary_redirect(&mut self, location: &str) {
        self.headers.clear();
        self.status = StatusCode::FOUND;
        self.direction = MessageDirection::Response;
        self.body = Bytes::new();
        self.body_is_user_created = false;
        if let Ok(value) = HeaderValue::from_str(location) {
            self.headers.insert(LOCATION, value);
        }
        self.headers.insert(EXPIRES, epoch_expires());
    }

    /// Loopback placeholder addresses for records not tied to a socket
    /// (replay snapshots in tests, synthetic messages).
    pub(crate) fn unspecified_addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
    }
}

/// `Expires: Thu, 01 Jan 1970 00:00:00 GMT`
fn epoch_expires() -> HeaderValue {
    let epoch = Utc.timestamp_opt(0, 0).unwrap();
    let formatted = epoch.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
    HeaderValue::from_str(&formatted).expect("epoch timestamp is valid ASCII")
}
