//! OS trust-store collaborator
//!
//! Installing and removing root certificates is platform work that lives
//! outside this crate. The store only needs two idempotent operations;
//! anything richer (user vs. machine store, browser NSS databases) is the
//! host's concern.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrustStoreError {
    #[error("trust store rejected certificate: {0}")]
    Rejected(String),

    #[error("trust store unavailable: {0}")]
    Unavailable(String),
}

/// Contract for the platform trusted-root store.
///
/// Both operations must be idempotent: removing an absent subject and
/// installing an already-present certificate succeed.
#[async_trait]
pub trait TrustStore: Send + Sync {
    /// Remove any trusted root whose subject common name equals
    /// `common_name`.
    async fn remove_by_subject(&self, common_name: &str) -> Result<(), TrustStoreError>;

    /// Install a DER-encoded certificate as a trusted root.
    async fn install(&self, der: &[u8]) -> Result<(), TrustStoreError>;
}

/// Trust store that accepts everything and records nothing. For
/// embeddings that manage trust out of band, and for tests.
#[derive(Debug, Default)]
pub struct NoopTrustStore;

#[async_trait]
impl TrustStore for NoopTrustStore {
    async fn remove_by_subject(&self, _common_name: &str) -> Result<(), TrustStoreError> {
        Ok(())
    }

    async fn install(&self, _der: &[u8]) -> Result<(), TrustStoreError> {
        Ok(())
    }
}
