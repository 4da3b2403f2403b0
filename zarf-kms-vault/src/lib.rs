//! HashiCorp Vault transit provider for Zarf.
//!
//! Talks to a transit secrets engine over HTTP. The transit API carries
//! base64 text in its request and response bodies, so this adapter owns
//! that framing at the transport boundary; the ciphertext itself is
//! Vault's `vault:v<n>:...` token string, stored as bytes.
//!
//! Transit has no generate-data-key operation, so generation is
//! synthesized: draw 32 random bytes, then encrypt them.
//!
//! The provider also exposes Vault's `sys/audit-hash` endpoint through
//! [`zarf::audit::AuditBackend`], producing deterministic, salted hashes
//! of encryption contexts for out-of-band audit correlation.
//!
//! # Example
//!
//! ```rust,no_run
//! use zarf_kms_vault::VaultKmsProvider;
//!
//! # fn example() -> Result<(), zarf_kms_vault::VaultKmsError> {
//! let provider = VaultKmsProvider::builder("http://127.0.0.1:8200", "s.token").build()?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use secrecy::{ExposeSecret, SecretVec};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zarf::audit::AuditBackend;
use zarf::error::ProviderError;
use zarf::provider::{random_data_key, DataKeyPair, KmsProvider};
use zarf::router::VAULT_KEY_PREFIX;
use zeroize::Zeroizing;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_MOUNT: &str = "transit";
const MAX_ATTEMPTS: usize = 2;

/// Errors specific to Vault transit operations.
#[derive(Debug, Error)]
pub enum VaultKmsError {
    /// Vault could not decrypt the ciphertext with the given key/context
    #[error("decryption failed")]
    DecryptionFailed,

    /// Token was rejected
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Network-level failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Vault API error
    #[error("vault error ({status}): {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Joined error strings from the response body
        message: String,
    },

    /// Response body could not be interpreted
    #[error("unexpected response: {0}")]
    Response(String),
}

impl From<VaultKmsError> for ProviderError {
    fn from(err: VaultKmsError) -> Self {
        match err {
            VaultKmsError::DecryptionFailed => Self::DecryptionFailed,
            VaultKmsError::Auth(msg) => Self::Auth(msg),
            VaultKmsError::Transport(msg) => Self::Transport(msg),
            VaultKmsError::Api { status, message } => {
                Self::Api(format!("vault error ({status}): {message}"))
            }
            VaultKmsError::Response(msg) => Self::Response(msg),
        }
    }
}

#[derive(Serialize)]
struct EncryptRequest<'a> {
    plaintext: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a str>,
}

#[derive(Serialize)]
struct DecryptRequest<'a> {
    ciphertext: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a str>,
}

#[derive(Serialize)]
struct AuditHashRequest<'a> {
    input: &'a str,
}

/// Vault wraps every payload in a `data` object.
#[derive(Deserialize)]
struct Wrapped<T> {
    data: T,
}

#[derive(Deserialize)]
struct EncryptData {
    ciphertext: String,
}

#[derive(Deserialize)]
struct DecryptData {
    plaintext: String,
}

#[derive(Deserialize)]
struct AuditHashData {
    hash: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<String>,
}

/// Vault transit provider implementation.
pub struct VaultKmsProvider {
    http: reqwest::Client,
    address: String,
    token: String,
    mount: String,
}

impl VaultKmsProvider {
    /// Starts building a provider for the Vault server at `address`,
    /// authenticating with `token`.
    #[must_use]
    pub fn builder(
        address: impl Into<String>,
        token: impl Into<String>,
    ) -> VaultKmsProviderBuilder {
        VaultKmsProviderBuilder {
            address: address.into(),
            token: token.into(),
            mount: DEFAULT_MOUNT.to_string(),
            timeout: DEFAULT_TIMEOUT,
            connect_timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Strips the routing scheme from a key identifier, leaving the
    /// transit key name.
    fn key_name(key_id: &str) -> &str {
        key_id.strip_prefix(VAULT_KEY_PREFIX).unwrap_or(key_id)
    }

    async fn write<T: DeserializeOwned>(
        &self,
        url: &str,
        body: &impl Serialize,
    ) -> Result<T, VaultKmsError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self
                .http
                .post(url)
                .header("X-Vault-Token", &self.token)
                .json(body)
                .send()
                .await;

            let response = match result {
                Ok(response) => response,
                Err(_) if attempt < MAX_ATTEMPTS => continue,
                Err(err) => return Err(VaultKmsError::Transport(err.to_string())),
            };

            let status = response.status();
            if status.is_server_error() && attempt < MAX_ATTEMPTS {
                continue;
            }

            if status.is_success() {
                return response
                    .json::<T>()
                    .await
                    .map_err(|e| VaultKmsError::Response(e.to_string()));
            }

            let message = response
                .json::<ErrorBody>()
                .await
                .map(|body| body.errors.join("; "))
                .unwrap_or_default();

            return Err(match status.as_u16() {
                401 | 403 => VaultKmsError::Auth(message),
                code => VaultKmsError::Api { status: code, message },
            });
        }
    }
}

/// Builder for [`VaultKmsProvider`].
pub struct VaultKmsProviderBuilder {
    address: String,
    token: String,
    mount: String,
    timeout: Duration,
    connect_timeout: Duration,
}

impl VaultKmsProviderBuilder {
    /// Overrides the transit engine mount path (default `transit`).
    #[must_use]
    pub fn mount(mut self, mount: impl Into<String>) -> Self {
        self.mount = mount.into();
        self
    }

    /// Sets the per-request read timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the connection timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Builds the provider.
    ///
    /// # Errors
    ///
    /// Returns [`VaultKmsError::Transport`] if the HTTP client cannot be
    /// built.
    pub fn build(self) -> Result<VaultKmsProvider, VaultKmsError> {
        let http = reqwest::Client::builder()
            .timeout(self.timeout)
            .connect_timeout(self.connect_timeout)
            .build()
            .map_err(|e| VaultKmsError::Transport(e.to_string()))?;

        Ok(VaultKmsProvider {
            http,
            address: self.address.trim_end_matches('/').to_string(),
            token: self.token,
            mount: self.mount,
        })
    }
}

#[async_trait::async_trait]
impl KmsProvider for VaultKmsProvider {
    async fn encrypt(
        &self,
        key_id: &str,
        plaintext: &[u8],
        context: Option<&[u8]>,
    ) -> Result<Vec<u8>, ProviderError> {
        let url = format!(
            "{}/v1/{}/encrypt/{}",
            self.address,
            self.mount,
            Self::key_name(key_id)
        );
        let plaintext = Zeroizing::new(STANDARD.encode(plaintext));
        let context = context.map(|c| STANDARD.encode(c));

        let response: Wrapped<EncryptData> = self
            .write(&url, &EncryptRequest { plaintext: &plaintext, context: context.as_deref() })
            .await?;

        Ok(response.data.ciphertext.into_bytes())
    }

    async fn decrypt(
        &self,
        key_id: &str,
        ciphertext: &[u8],
        context: Option<&[u8]>,
    ) -> Result<SecretVec<u8>, ProviderError> {
        let url = format!(
            "{}/v1/{}/decrypt/{}",
            self.address,
            self.mount,
            Self::key_name(key_id)
        );
        let ciphertext = std::str::from_utf8(ciphertext)
            .map_err(|_| VaultKmsError::Response("ciphertext is not a vault token".to_string()))?;
        let context = context.map(|c| STANDARD.encode(c));

        let response: Wrapped<DecryptData> = self
            .write(&url, &DecryptRequest { ciphertext, context: context.as_deref() })
            .await
            .map_err(|err| match err {
                VaultKmsError::Api { status: 400, ref message }
                    if message.contains("unable to decrypt") =>
                {
                    VaultKmsError::DecryptionFailed
                }
                other => other,
            })?;

        let plaintext = STANDARD
            .decode(&response.data.plaintext)
            .map_err(|e| VaultKmsError::Response(format!("invalid plaintext encoding: {e}")))?;
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

#[async_trait::async_trait]
impl AuditBackend for VaultKmsProvider {
    async fn audit_hash(&self, input: &[u8], path: &str) -> Result<String, ProviderError> {
        let url = format!("{}/v1/sys/audit-hash/{path}", self.address);
        let input = STANDARD.encode(input);

        let response: Wrapped<AuditHashData> =
            self.write(&url, &AuditHashRequest { input: &input }).await?;
        Ok(response.data.hash)
    }
}
