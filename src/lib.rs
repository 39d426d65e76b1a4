//! Gatewarden - Transparent Filtering MITM Proxy Core
//!
//! Gatewarden is a transparent, filtering man-in-the-middle proxy for
//! HTTP/1.x, HTTPS and WebSocket traffic on a single host. A platform
//! packet diverter steers selected processes' flows to the proxy's
//! listeners; the proxy terminates TLS with spoofed per-host
//! certificates, establishes the upstream leg itself and hands every
//! message to host callbacks that may allow, block, modify, buffer,
//! stream-inspect or replay it.
//!
//! ## Features
//!
//! - **TLS interception**: ClientHello peek, SNI extraction, per-host
//!   leaf certificates signed by an in-memory CA installed into the OS
//!   trust store
//! - **Inspection pipeline**: seven-valued `ProxyNextAction` drives
//!   pass-through, bounded whole-body buffering, streamed inspection,
//!   delegation and drops, per request and per response
//! - **WebSocket bridging**: per-hop handshakes with subprotocol
//!   propagation and optional per-frame inspection
//! - **Response replay**: live duplicates of upstream responses served
//!   from a loopback endpoint keyed by message id
//!
//! ## Usage
//!
//! ```rust,no_run
//! use gatewarden::{NoopTrustStore, NullDiverterFactory, ProxyConfig, ProxyEngine, ProxyHandler};
//! use std::sync::Arc;
//!
//! struct Passthrough;
//! impl ProxyHandler for Passthrough {}
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ProxyConfig::new(
//!         Arc::new(Passthrough),
//!         Arc::new(NoopTrustStore),
//!         Arc::new(NullDiverterFactory),
//!     );
//!     let engine = ProxyEngine::new(config).await?;
//!     engine.start().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! Gatewarden is a library meant to be embedded in a host application:
//!
//! - `certs` - spoofed CA, leaf cache and trust-store collaborator
//! - `tls` - ClientHello peek, SNI adapter and byte-replay stream
//! - `proxy` - dispatcher, HTTP transaction machine, inspection streams,
//!   websocket bridge
//! - `replay` - response duplicates and the loopback replay listener
//! - `engine` - lifecycle controller binding listeners and the diverter
//! - `diverter` - platform diverter and firewall contracts

// Host-facing surface
pub mod config;
pub mod diverter;
pub mod engine;
pub mod message;

// Interception core
pub mod certs;
pub mod headers;
pub mod tls;

// Pipeline
pub mod proxy;
pub mod replay;

/// Configuration and callback surface
pub use config::{
    ProxyConfig, ProxyHandler, StreamEvent, StreamVerdict, DEFAULT_AUTHORITY_NAME,
};

/// Lifecycle
pub use engine::{EngineError, ProxyEngine, StatsSnapshot};

/// Per-transaction record
pub use message::{MessageDirection, MessageInfo, MessageProtocol, ProxyNextAction};

/// Certificates and trust
pub use certs::store::{DownstreamTlsRange, LeafCert, SpoofedCertStore};
pub use certs::trust::{NoopTrustStore, TrustStore, TrustStoreError};

/// Diverter contracts
pub use diverter::{
    Diverter, DiverterEndpoints, DiverterFactory, FirewallAction, FirewallRequest,
    FirewallResponse, NullDiverter, NullDiverterFactory,
};

/// Header filtering
pub use headers::FilterScope;

/// Replay
pub use replay::{ReplayControl, ResponseReplay, MAX_REPLAY_BUFFER_BYTES};

/// Transaction errors
pub use proxy::TransactionError;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
