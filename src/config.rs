//! Host configuration and callback surface
//!
//! The proxy is a library: the embedding host supplies every policy
//! decision through [`ProxyHandler`] and the platform collaborators
//! (trust store, diverter factory) through [`ProxyConfig`]. All callbacks
//! are value-returning; errors from upstream are values too, never
//! unwound through the host.

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use std::sync::Arc;

use crate::certs::{DownstreamTlsRange, TrustStore};
use crate::diverter::{DiverterFactory, FirewallRequest, FirewallResponse};
use crate::message::MessageInfo;
use crate::replay::ReplayControl;

/// Default common name for the minted authority.
pub const DEFAULT_AUTHORITY_NAME: &str = "CitadelCore";

/// One event observed by a streamed-inspection callback.
#[derive(Debug)]
pub enum StreamEvent<'a> {
    /// A chunk flowing through the inspected stream.
    Data(&'a Bytes),
    /// The stream reached its end. Fired exactly once per stream,
    /// including teardown paths.
    Closed,
}

/// Verdict returned by the streamed-inspection callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamVerdict {
    Continue,
    /// Tear the stream down immediately.
    Drop,
}

/// The host callback surface invoked at every inspection point.
///
/// Per-chunk and per-frame callbacks run inline on the task that produced
/// them and must not block for long. Within one transaction callbacks
/// fire in strict order: request-begin, request body events,
/// response-begin, response body events, end of stream. Default
/// implementations pass traffic through untouched.
#[async_trait]
pub trait ProxyHandler: Send + Sync + 'static {
    /// Decide whether a flow the diverter observed should be filtered.
    async fn firewall_check(&self, _request: FirewallRequest) -> FirewallResponse {
        FirewallResponse::filter()
    }

    /// Announces a new request or response. Steer the transaction by
    /// setting `info.next_action`; mutate headers or assign a body as
    /// needed.
    async fn message_begin(&self, _info: &mut MessageInfo) {}

    /// Whole-body inspection after the body was fully buffered (bounded).
    /// Also invoked once per websocket frame when frame inspection is
    /// enabled. Setting `next_action` to `DropConnection` terminates the
    /// transaction.
    async fn whole_body_inspection(&self, _info: &mut MessageInfo) {}

    /// Streamed inspection, invoked for every chunk and once on close.
    async fn streamed_inspection(
        &self,
        _info: &MessageInfo,
        _event: StreamEvent<'_>,
    ) -> StreamVerdict {
        StreamVerdict::Continue
    }

    /// A response replay started; `control` carries the loopback URL and
    /// a termination handle.
    async fn replay_inspection(&self, _info: &MessageInfo, _control: ReplayControl) {}

    /// The transaction was delegated wholesale to the host. The returned
    /// response is sent to the client verbatim.
    async fn external_request(&self, _info: &MessageInfo) -> http::Response<Bytes> {
        http::Response::builder()
            .status(StatusCode::NOT_IMPLEMENTED)
            .body(Bytes::new())
            .expect("static response")
    }
}

/// Host configuration consumed by the engine.
#[derive(Clone)]
pub struct ProxyConfig {
    /// CN for the minted certificate authority.
    pub authority_name: String,
    /// Forwarded to the diverter: drop flows already bound to an external
    /// proxy.
    pub block_external_proxies: bool,
    /// Replaces the default upstream client wholesale. The default client
    /// decompresses gzip and deflate, keeps cookies off and follows no
    /// redirects.
    pub custom_proxy_handler: Option<reqwest::Client>,
    /// The host callback surface. Required.
    pub handler: Arc<dyn ProxyHandler>,
    /// Platform trusted-root store collaborator. Required.
    pub trust_store: Arc<dyn TrustStore>,
    /// Builds the platform diverter once endpoints are known. Required.
    pub diverter_factory: Arc<dyn DiverterFactory>,
    /// Protocol range offered to intercepted (downstream) clients.
    pub downstream_tls: DownstreamTlsRange,
}

impl ProxyConfig {
    pub fn new(
        handler: Arc<dyn ProxyHandler>,
        trust_store: Arc<dyn TrustStore>,
        diverter_factory: Arc<dyn DiverterFactory>,
    ) -> Self {
        Self {
            authority_name: DEFAULT_AUTHORITY_NAME.to_string(),
            block_external_proxies: true,
            custom_proxy_handler: None,
            handler,
            trust_store,
            diverter_factory,
            downstream_tls: DownstreamTlsRange::default(),
        }
    }

    pub fn with_authority_name(mut self, name: impl Into<String>) -> Self {
        self.authority_name = name.into();
        self
    }

    pub fn with_block_external_proxies(mut self, block: bool) -> Self {
        self.block_external_proxies = block;
        self
    }

    pub fn with_custom_proxy_handler(mut self, client: reqwest::Client) -> Self {
        self.custom_proxy_handler = Some(client);
        self
    }

    pub fn with_downstream_tls(mut self, range: DownstreamTlsRange) -> Self {
        self.downstream_tls = range;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), &'static str> {
        if self.authority_name.trim().is_empty() {
            return Err("authority_name must not be empty");
        }
        Ok(())
    }

    /// The stock upstream client: automatic gzip and deflate
    /// decompression, cookies off, redirects off, no upstream proxy.
    pub fn default_upstream_client() -> reqwest::Result<reqwest::Client> {
        reqwest::Client::builder()
            .gzip(true)
            .deflate(true)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
    }
}

impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("authority_name", &self.authority_name)
            .field("block_external_proxies", &self.block_external_proxies)
            .field(
                "custom_proxy_handler",
                &self.custom_proxy_handler.is_some(),
            )
            .field("downstream_tls", &self.downstream_tls)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs::trust::NoopTrustStore;
    use crate::diverter::NullDiverterFactory;

    struct PassthroughHandler;
    impl ProxyHandler for PassthroughHandler {}

    fn config() -> ProxyConfig {
        ProxyConfig::new(
            Arc::new(PassthroughHandler),
            Arc::new(NoopTrustStore),
            Arc::new(NullDiverterFactory),
        )
    }

    #[test]
    fn test_defaults() {
        let config = config();
        assert_eq!(config.authority_name, DEFAULT_AUTHORITY_NAME);
        assert!(config.block_external_proxies);
        assert!(config.custom_proxy_handler.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_authority_rejected() {
        let config = config().with_authority_name("   ");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_client_builds() {
        assert!(ProxyConfig::default_upstream_client().is_ok());
    }
}
