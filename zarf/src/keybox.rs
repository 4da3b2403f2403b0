//! Envelope encrypt/decrypt/generate engine for wrapped data keys.
//!
//! A [`KeyBox`] owns one logical key: the identifier of the currently
//! active version plus the identifiers of every previous version still
//! protecting data. Encryption always emits the current envelope format
//! under the active version; decryption accepts every format ever written.

use crate::context::{CanonicalMode, EncryptionContext};
use crate::envelope::{self, ParsedEnvelope};
use crate::error::Error;
use crate::provider::ProviderRegistry;
use crate::router::{self, ProviderKind, TEST_KEY_ID};
use secrecy::SecretVec;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Envelope engine for one logical key.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use zarf::context::EncryptionContext;
/// use zarf::keybox::KeyBox;
/// use zarf::provider::ProviderRegistry;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), zarf::error::Error> {
/// let registry = Arc::new(ProviderRegistry::new());
/// let keybox = KeyBox::new(registry, "insecure-test-key");
/// let context = EncryptionContext::new().with("user_id", 1);
///
/// let envelope = keybox.encrypt(b"hello", &context).await?;
/// assert!(envelope.starts_with("v1:"));
/// let plaintext = keybox.decrypt(&envelope, &context).await?;
/// # Ok(())
/// # }
/// ```
pub struct KeyBox {
    registry: Arc<ProviderRegistry>,
    key_id: String,
    version: u32,
    previous_versions: BTreeMap<u32, String>,
    data_key: bool,
}

impl KeyBox {
    /// Creates a key box for the given key identifier at version 1 with no
    /// previous versions.
    pub fn new(registry: Arc<ProviderRegistry>, key_id: impl Into<String>) -> Self {
        Self {
            registry,
            key_id: key_id.into(),
            version: 1,
            previous_versions: BTreeMap::new(),
            data_key: false,
        }
    }

    /// Sets the currently active version number.
    #[must_use]
    pub const fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Sets the key identifiers of previous versions.
    #[must_use]
    pub fn with_previous_versions(mut self, previous_versions: BTreeMap<u32, String>) -> Self {
        self.previous_versions = previous_versions;
        self
    }

    /// Marks instrumentation events as data-key operations.
    #[must_use]
    pub const fn for_data_keys(mut self) -> Self {
        self.data_key = true;
        self
    }

    /// Resolves the key identifier active at `version`.
    ///
    /// The previous-versions table wins; the primary identifier applies
    /// only to the currently active version. Any version ever used to
    /// encrypt must stay resolvable as long as data under it exists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::VersionNotActive`] for an unknown version and
    /// [`Error::Configuration`] for a known version with an empty
    /// identifier.
    pub fn version_key_id(&self, version: u32) -> Result<&str, Error> {
        let key_id = if let Some(key_id) = self.previous_versions.get(&version) {
            key_id.as_str()
        } else if self.version == version {
            self.key_id.as_str()
        } else {
            return Err(Error::VersionNotActive { version });
        };

        if key_id.is_empty() {
            return Err(Error::Configuration("missing key id".to_string()));
        }
        Ok(key_id)
    }

    /// Encrypts `plaintext` under the active version, returning a
    /// current-format envelope. Legacy forms are never written.
    ///
    /// # Errors
    ///
    /// Returns configuration, context, or provider errors.
    pub async fn encrypt(
        &self,
        plaintext: &[u8],
        context: &EncryptionContext,
    ) -> Result<String, Error> {
        let key_id = self.version_key_id(self.version)?;
        let context_bytes = context.canonicalize(CanonicalMode::Normalized)?;
        let (_, provider) = self.registry.provider_for(key_id)?;

        let started = Instant::now();
        let ciphertext = provider.encrypt(key_id, plaintext, Some(&context_bytes)).await?;
        self.instrument("encrypt", key_id, &context_bytes, started);

        Ok(envelope::encode(self.version, &ciphertext))
    }

    /// Decrypts a stored envelope of any supported format.
    ///
    /// The envelope decides the version, the context canonicalization
    /// mode, and (for the legacy Google form) the key identifier itself.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedEnvelope`] for an unrecognized format,
    /// [`Error::VersionNotActive`] for an unresolvable version, and
    /// [`Error::DecryptionFailed`] when the provider rejects the
    /// ciphertext or context.
    pub async fn decrypt(
        &self,
        stored: &str,
        context: &EncryptionContext,
    ) -> Result<SecretVec<u8>, Error> {
        let parsed = envelope::decode(stored)?;
        let context_bytes = context.canonicalize(parsed.context_mode())?;

        let (key_id, kind) = match &parsed {
            ParsedEnvelope::Current { version, .. } => {
                let key_id = self.version_key_id(*version)?;
                (key_id.to_string(), router::route(key_id)?)
            }
            ParsedEnvelope::LegacyTest { .. } => (TEST_KEY_ID.to_string(), ProviderKind::Test),
            ParsedEnvelope::LegacyGoogle { key_id, .. } => {
                (key_id.clone(), ProviderKind::Google)
            }
            ParsedEnvelope::LegacyVault { .. } => {
                (self.version_key_id(parsed.version())?.to_string(), ProviderKind::Vault)
            }
        };

        let provider = self.registry.get(kind)?;
        let started = Instant::now();
        let plaintext =
            provider.decrypt(&key_id, parsed.ciphertext(), Some(&context_bytes)).await?;
        self.instrument("decrypt", &key_id, &context_bytes, started);

        Ok(plaintext)
    }

    /// Generates a fresh data key under the active version, returning the
    /// plaintext material and its envelope.
    ///
    /// # Errors
    ///
    /// Returns configuration, context, or provider errors.
    pub async fn generate_data_key(
        &self,
        context: &EncryptionContext,
    ) -> Result<(SecretVec<u8>, String), Error> {
        let key_id = self.version_key_id(self.version)?;
        let context_bytes = context.canonicalize(CanonicalMode::Normalized)?;
        let (_, provider) = self.registry.provider_for(key_id)?;

        let started = Instant::now();
        let (plaintext, ciphertext) =
            provider.generate_data_key(key_id, Some(&context_bytes)).await?;
        self.instrument("generate_data_key", key_id, &context_bytes, started);

        Ok((plaintext, envelope::encode(self.version, &ciphertext)))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn instrument(&self, operation: &str, key_id: &str, context: &[u8], started: Instant) {
        debug!(
            target: "zarf",
            key_id,
            context = %String::from_utf8_lossy(context),
            data_key = self.data_key,
            elapsed_ms = started.elapsed().as_millis() as u64,
            operation,
        );
    }
}
