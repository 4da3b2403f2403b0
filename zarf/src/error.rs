//! Error types for `Zarf` operations.

/// Main error type for `Zarf` operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Key slot or registry configuration is unusable (missing key id,
    /// missing version, unregistered provider). Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Stored ciphertext does not match any known envelope format.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// A rotation version was referenced that has no known key identifier.
    #[error("version not active: {version}")]
    VersionNotActive {
        /// The offending version number
        version: u32,
    },

    /// The provider rejected the ciphertext, context, or key.
    ///
    /// Deliberately opaque: auth failures, corrupted blobs, and context
    /// mismatches all collapse into this variant so callers cannot learn
    /// which part of the authenticated envelope was wrong.
    #[error("decryption failed")]
    DecryptionFailed,

    /// Encryption context contained a value that is not a string or integer.
    #[error("invalid context: {0}")]
    InvalidContext(String),

    /// Provider operation failed (transient network/auth/API failures).
    #[error("provider error: {0}")]
    Provider(ProviderError),
}

impl From<ProviderError> for Error {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::DecryptionFailed => Self::DecryptionFailed,
            other => Self::Provider(other),
        }
    }
}

/// Errors reported by KMS provider adapters.
///
/// Adapter crates translate their provider-specific failures into these
/// variants before they cross the adapter boundary; no SDK or HTTP error
/// type ever reaches a caller of the lifecycle manager.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The provider rejected the ciphertext or its authenticated context.
    #[error("decryption failed")]
    DecryptionFailed,

    /// Credentials were rejected by the provider.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Network-level failure reaching the provider.
    #[error("transport error: {0}")]
    Transport(String),

    /// Provider-reported API failure.
    #[error("provider error: {0}")]
    Api(String),

    /// Provider returned a response the adapter could not interpret.
    #[error("unexpected provider response: {0}")]
    Response(String),
}
