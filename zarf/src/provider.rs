//! KMS provider abstraction and registry.
//!
//! Each remote backend implements [`KmsProvider`]; the registry maps a
//! routed [`ProviderKind`] to its adapter instance. The registry is built
//! once at setup time and passed into the lifecycle manager, so there are
//! no process-wide client singletons.

use crate::error::{Error, ProviderError};
use crate::router::{self, ProviderKind};
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::SecretVec;
use std::collections::HashMap;
use std::sync::Arc;

/// Size of a plaintext data key in bytes (256 bits).
pub const DATA_KEY_SIZE: usize = 32;

/// A freshly generated data key: plaintext material and the
/// provider-wrapped ciphertext.
pub type DataKeyPair = (SecretVec<u8>, Vec<u8>);

/// KMS operations the core requires from each backend.
///
/// Implementations must be thread-safe (`Send + Sync`). The `context`
/// argument is the canonicalized encryption context, or `None` when no
/// context should be bound. Plaintext outputs are returned as
/// [`SecretVec`] so key material is zeroized on drop.
#[async_trait::async_trait]
pub trait KmsProvider: Send + Sync {
    /// Encrypts `plaintext` under the remote key `key_id`.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] if the remote call fails.
    async fn encrypt(
        &self,
        key_id: &str,
        plaintext: &[u8],
        context: Option<&[u8]>,
    ) -> Result<Vec<u8>, ProviderError>;

    /// Decrypts a provider ciphertext.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::DecryptionFailed`] when the provider
    /// rejects the ciphertext or its authenticated context; other variants
    /// for transport and API failures.
    async fn decrypt(
        &self,
        key_id: &str,
        ciphertext: &[u8],
        context: Option<&[u8]>,
    ) -> Result<SecretVec<u8>, ProviderError>;

    /// Generates a data key wrapped under `key_id`.
    ///
    /// Backends without a native generate-data-key operation synthesize
    /// one: draw [`DATA_KEY_SIZE`] random bytes, then encrypt them.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] if the remote call fails.
    async fn generate_data_key(
        &self,
        key_id: &str,
        context: Option<&[u8]>,
    ) -> Result<DataKeyPair, ProviderError>;
}

/// Draws fresh random data-key material from the OS.
#[must_use]
pub fn random_data_key() -> SecretVec<u8> {
    let mut key = vec![0u8; DATA_KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    SecretVec::new(key)
}

/// Maps provider kinds to adapter instances.
///
/// A new registry already contains the local test provider; cloud adapters
/// are registered explicitly by the caller that owns their clients.
///
/// # Example
///
/// ```
/// use zarf::provider::ProviderRegistry;
/// use zarf::router::ProviderKind;
///
/// let registry = ProviderRegistry::new();
/// assert!(registry.get(ProviderKind::Test).is_ok());
/// assert!(registry.get(ProviderKind::Aws).is_err());
/// ```
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn KmsProvider>>,
}

impl ProviderRegistry {
    /// Creates a registry with only the test provider registered.
    #[must_use]
    pub fn new() -> Self {
        let mut providers: HashMap<ProviderKind, Arc<dyn KmsProvider>> = HashMap::new();
        providers.insert(ProviderKind::Test, Arc::new(crate::test_provider::TestKmsProvider));
        Self { providers }
    }

    /// Registers an adapter for a provider kind, replacing any existing one.
    #[must_use]
    pub fn register(mut self, kind: ProviderKind, provider: Arc<dyn KmsProvider>) -> Self {
        self.providers.insert(kind, provider);
        self
    }

    /// Looks up the adapter for a provider kind.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if no adapter is registered.
    pub fn get(&self, kind: ProviderKind) -> Result<&Arc<dyn KmsProvider>, Error> {
        self.providers
            .get(&kind)
            .ok_or_else(|| Error::Configuration(format!("no provider registered for {kind}")))
    }

    /// Routes a key identifier and looks up its adapter in one step.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for an empty identifier or an
    /// unregistered provider kind.
    pub fn provider_for(&self, key_id: &str) -> Result<(ProviderKind, &Arc<dyn KmsProvider>), Error> {
        let kind = router::route(key_id)?;
        Ok((kind, self.get(kind)?))
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
