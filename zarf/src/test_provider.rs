//! Local, insecure provider for tests and development.
//!
//! No network, no credentials. Ciphertexts embed the plaintext and the
//! canonicalized context in the clear, and decryption validates the
//! embedded context against the caller's, so the context-binding failure
//! mode of the real providers is reproduced exactly.

use crate::envelope::LEGACY_TEST_PREFIX;
use crate::error::ProviderError;
use crate::provider::{random_data_key, DataKeyPair, KmsProvider};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use secrecy::{ExposeSecret, SecretVec};
use zeroize::Zeroizing;

/// The provider behind the `insecure-test-key` sentinel.
///
/// Never use outside tests: ciphertexts are reversible by anyone.
pub struct TestKmsProvider;

fn context_bytes(context: Option<&[u8]>) -> &[u8] {
    // an absent context binds the same way as an empty one
    context.unwrap_or(b"{}")
}

#[async_trait::async_trait]
impl KmsProvider for TestKmsProvider {
    async fn encrypt(
        &self,
        _key_id: &str,
        plaintext: &[u8],
        context: Option<&[u8]>,
    ) -> Result<Vec<u8>, ProviderError> {
        let encoded = Zeroizing::new(STANDARD.encode(plaintext));
        let ciphertext = format!(
            "{LEGACY_TEST_PREFIX}:{}:{}",
            encoded.as_str(),
            STANDARD.encode(context_bytes(context))
        );
        Ok(ciphertext.into_bytes())
    }

    async fn decrypt(
        &self,
        _key_id: &str,
        ciphertext: &[u8],
        context: Option<&[u8]>,
    ) -> Result<SecretVec<u8>, ProviderError> {
        let ciphertext =
            std::str::from_utf8(ciphertext).map_err(|_| ProviderError::DecryptionFailed)?;

        let mut fields = ciphertext.splitn(3, ':');
        let (Some(LEGACY_TEST_PREFIX), Some(plaintext), Some(stored_context)) =
            (fields.next(), fields.next(), fields.next())
        else {
            return Err(ProviderError::DecryptionFailed);
        };

        let stored_context =
            STANDARD.decode(stored_context).map_err(|_| ProviderError::DecryptionFailed)?;
        if stored_context != context_bytes(context) {
            return Err(ProviderError::DecryptionFailed);
        }

        let plaintext = STANDARD.decode(plaintext).map_err(|_| ProviderError::DecryptionFailed)?;
        Ok(SecretVec::new(plaintext))
    }

    async fn generate_data_key(
        &self,
        key_id: &str,
        context: Option<&[u8]>,
    ) -> Result<DataKeyPair, ProviderError> {
        let plaintext = random_data_key();
        let ciphertext = self.encrypt(key_id, plaintext.expose_secret(), context).await?;
        Ok((plaintext, ciphertext))
    }
}
