//! Spoofed certificate authority
//!
//! An in-memory CA minted once per process, installed into the OS trust
//! store through an injected collaborator, issuing memoized per-host leaf
//! certificates so the TLS adapter can terminate intercepted connections.

pub mod store;
pub mod trust;

pub use store::{CertStoreError, DownstreamTlsRange, LeafCert, SpoofedCertStore};
pub use trust::{TrustStore, TrustStoreError};
