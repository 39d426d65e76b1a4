//! Forbidden-header filter
//!
//! Classifies header names that must not be copied across the proxy.
//! Hop-by-hop and content-negotiation headers are managed by the proxy
//! itself (the upstream client negotiates its own encodings and the
//! server side reframes bodies), so forwarding the client's values would
//! corrupt the exchange. A second, wider set applies to websocket
//! upgrades, where the handshake headers are regenerated per hop.

use http::header::HeaderName;
use std::collections::HashSet;

/// Headers stripped when copying an HTTP request or response across the proxy.
const FORBIDDEN_HTTP: &[&str] = &[
    "x-sdhc",
    "avail-dictionary",
    "content-length",
    "content-encoding",
    "alternate-protocol",
    "alt-svc",
    "public-key-pins",
    "public-key-pins-report-only",
    "get-dictionary",
    "accept-encoding",
    "transfer-encoding",
];

/// Additional headers stripped on websocket upgrades. The websocket
/// handshake is regenerated per hop, and cookies/subprotocols are carried
/// explicitly by the bridge rather than blind-copied.
const FORBIDDEN_WEBSOCKET_EXTRA: &[&str] = &[
    "sec-websocket-extensions",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-accept",
    "cookie",
    "connection",
    "upgrade",
];

/// Which forbidden set applies to a copy operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterScope {
    /// Plain HTTP request/response copying.
    Http,
    /// WebSocket upgrade header copying (HTTP set plus handshake headers).
    WebSocket,
}

/// Returns true when `name` must be stripped under `scope`, ignoring any
/// per-transaction exemptions (see [`should_copy`]).
pub fn is_forbidden(name: &HeaderName, scope: FilterScope) -> bool {
    let lower = name.as_str();
    if FORBIDDEN_HTTP.contains(&lower) {
        return true;
    }
    scope == FilterScope::WebSocket && FORBIDDEN_WEBSOCKET_EXTRA.contains(&lower)
}

/// Decide whether a header may be copied across the proxy.
///
/// A forbidden header is still copied when the transaction exempted it.
/// `Host` is never forbidden here; callers set it explicitly from the
/// original request rather than copying it.
pub fn should_copy(
    name: &HeaderName,
    scope: FilterScope,
    exempted: &HashSet<HeaderName>,
) -> bool {
    !is_forbidden(name, scope) || exempted.contains(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> HeaderName {
        HeaderName::from_bytes(s.as_bytes()).unwrap()
    }

    #[test]
    fn test_http_set_members() {
        for forbidden in [
            "Content-Length",
            "content-encoding",
            "Accept-Encoding",
            "Transfer-Encoding",
            "Alt-Svc",
            "Public-Key-Pins",
        ] {
            assert!(
                is_forbidden(&name(&forbidden.to_lowercase()), FilterScope::Http),
                "{forbidden} should be forbidden for HTTP"
            );
        }
    }

    #[test]
    fn test_ordinary_headers_pass() {
        for ok in ["host", "user-agent", "set-cookie", "authorization", "date"] {
            assert!(!is_forbidden(&name(ok), FilterScope::Http));
        }
    }

    #[test]
    fn test_websocket_set_is_superset() {
        // Everything forbidden for HTTP is forbidden for websocket too.
        for forbidden in FORBIDDEN_HTTP {
            assert!(is_forbidden(&name(forbidden), FilterScope::WebSocket));
        }
        // Handshake headers are only forbidden for websocket.
        assert!(is_forbidden(&name("sec-websocket-key"), FilterScope::WebSocket));
        assert!(!is_forbidden(&name("sec-websocket-key"), FilterScope::Http));
        assert!(is_forbidden(&name("cookie"), FilterScope::WebSocket));
        assert!(!is_forbidden(&name("cookie"), FilterScope::Http));
    }

    #[test]
    fn test_exemption_bypasses_filter() {
        let mut exempted = HashSet::new();
        exempted.insert(name("accept-encoding"));

        assert!(should_copy(
            &name("accept-encoding"),
            FilterScope::Http,
            &exempted
        ));
        assert!(!should_copy(
            &name("transfer-encoding"),
            FilterScope::Http,
            &exempted
        ));
    }
}
