//! Deterministic context hashing for out-of-band audit logs.
//!
//! The hash is produced by a provider-salted endpoint so audit records can
//! be correlated without ever writing the raw context to a log.

use crate::context::{CanonicalMode, EncryptionContext};
use crate::error::{Error, ProviderError};

/// A backend able to produce deterministic, salted hashes of opaque input.
/// Implemented by the Vault adapter over its `sys/audit-hash` endpoint.
#[async_trait::async_trait]
pub trait AuditBackend: Send + Sync {
    /// Hashes `input` with the salt configured for the audit device at
    /// `path`.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] if the remote call fails.
    async fn audit_hash(&self, input: &[u8], path: &str) -> Result<String, ProviderError>;
}

/// Canonicalizes `context` and returns its provider-salted audit hash.
///
/// The same logical context always produces the same hash for a given
/// audit device, regardless of construction order.
///
/// # Errors
///
/// Returns context or provider errors.
pub async fn context_hash(
    backend: &dyn AuditBackend,
    context: &EncryptionContext,
    path: &str,
) -> Result<String, Error> {
    let input = context.canonicalize(CanonicalMode::Normalized)?;
    Ok(backend.audit_hash(&input, path).await?)
}
