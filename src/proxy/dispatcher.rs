//! Request dispatcher
//!
//! A decrypted (or plain) stream yields parsed requests; each is routed
//! to the HTTP transaction handler or the websocket bridge. The routing
//! set is closed: anything claiming an upgrade without being a GET
//! websocket upgrade is refused.

use http::{header, Method, Request};

/// Where an accepted request goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route {
    Http,
    WebSocket,
    Close,
}

/// Classify one parsed request.
pub(crate) fn route<B>(req: &Request<B>) -> Route {
    let wants_websocket = req
        .headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    if wants_websocket {
        if req.method() == Method::GET {
            Route::WebSocket
        } else {
            Route::Close
        }
    } else {
        Route::Http
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: Method, upgrade: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().method(method).uri("/");
        if let Some(value) = upgrade {
            builder = builder.header(header::UPGRADE, value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_plain_get_routes_http() {
        assert_eq!(route(&request(Method::GET, None)), Route::Http);
        assert_eq!(route(&request(Method::POST, None)), Route::Http);
    }

    #[test]
    fn test_websocket_upgrade_routes_bridge() {
        assert_eq!(
            route(&request(Method::GET, Some("websocket"))),
            Route::WebSocket
        );
        assert_eq!(
            route(&request(Method::GET, Some("WebSocket"))),
            Route::WebSocket
        );
    }

    #[test]
    fn test_non_get_upgrade_closes() {
        assert_eq!(route(&request(Method::POST, Some("websocket"))), Route::Close);
    }

    #[test]
    fn test_other_upgrade_routes_http() {
        assert_eq!(route(&request(Method::GET, Some("h2c"))), Route::Http);
    }
}
