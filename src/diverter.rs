//! Packet-diverter collaborator contract
//!
//! The platform component that redirects selected processes' traffic to
//! the proxy's listeners lives outside this crate. The engine publishes
//! the endpoints it bound through [`DiverterFactory::create`] and drives
//! the returned [`Diverter`] across start/stop. Firewall decisions flow
//! the other way: the diverter consults the host's firewall callback for
//! every new flow it sees.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::ProxyHandler;

/// Verdict for a flow the diverter asked about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirewallAction {
    /// Let the application's traffic pass without diversion.
    DontFilterApplication,
    /// Divert the application's traffic through the proxy.
    FilterApplication,
    /// Drop the application's internet access entirely.
    BlockInternetForApplication,
}

/// A flow the diverter observed and wants a decision for.
#[derive(Debug, Clone)]
pub struct FirewallRequest {
    /// Absolute path of the originating binary, or the literal `"SYSTEM"`
    /// for kernel-owned flows.
    pub binary_path: String,
    pub process_id: u32,
    pub local_port: u16,
    pub remote_port: u16,
}

/// Host decision for a [`FirewallRequest`].
#[derive(Debug, Clone, Copy)]
pub struct FirewallResponse {
    pub action: FirewallAction,
    /// When the flow rides a non-standard port the diverter cannot guess
    /// whether it is TLS; the host may hint.
    pub encrypted_hint: Option<bool>,
}

impl FirewallResponse {
    pub fn filter() -> Self {
        Self {
            action: FirewallAction::FilterApplication,
            encrypted_hint: None,
        }
    }

    pub fn pass() -> Self {
        Self {
            action: FirewallAction::DontFilterApplication,
            encrypted_hint: None,
        }
    }
}

/// The four endpoints the engine actually bound, published to the
/// diverter. Each public listener serves HTTP and HTTPS on one port (the
/// TLS adapter auto-detects), so the http/https pair of a family shares
/// its port by construction; they are still reported separately and never
/// cross address families.
#[derive(Debug, Clone, Copy)]
pub struct DiverterEndpoints {
    pub v4_http: SocketAddr,
    pub v4_https: SocketAddr,
    pub v6_http: SocketAddr,
    pub v6_https: SocketAddr,
}

/// Platform packet diverter. Implementations redirect packets belonging
/// to filtered processes to the published endpoints.
#[async_trait]
pub trait Diverter: Send + Sync {
    /// Start diverting. `num_threads <= 0` means one thread per logical
    /// core.
    async fn start(&self, num_threads: i32) -> anyhow::Result<()>;

    /// Stop diverting. Must be idempotent.
    async fn stop(&self);

    /// Whether flows already bound to an external proxy are dropped.
    fn drop_external_proxies(&self) -> bool;
}

/// Builds the platform diverter once the engine knows its endpoints. The
/// handler is passed along so diverters can consult
/// [`ProxyHandler::firewall_check`] per flow;
/// `block_external_proxies` mirrors the host configuration flag.
pub trait DiverterFactory: Send + Sync {
    fn create(
        &self,
        endpoints: DiverterEndpoints,
        handler: Arc<dyn ProxyHandler>,
        block_external_proxies: bool,
    ) -> anyhow::Result<Arc<dyn Diverter>>;
}

/// Diverter that diverts nothing. Useful for embeddings that route
/// traffic to the listeners themselves (tests, explicit-proxy setups).
#[derive(Debug, Default)]
pub struct NullDiverter;

#[async_trait]
impl Diverter for NullDiverter {
    async fn start(&self, _num_threads: i32) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self) {}

    fn drop_external_proxies(&self) -> bool {
        false
    }
}

/// Factory producing [`NullDiverter`].
#[derive(Debug, Default)]
pub struct NullDiverterFactory;

impl DiverterFactory for NullDiverterFactory {
    fn create(
        &self,
        _endpoints: DiverterEndpoints,
        _handler: Arc<dyn ProxyHandler>,
        _block_external_proxies: bool,
    ) -> anyhow::Result<Arc<dyn Diverter>> {
        Ok(Arc::new(NullDiverter))
    }
}
