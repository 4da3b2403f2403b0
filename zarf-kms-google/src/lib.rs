//! Google Cloud KMS provider for Zarf.
//!
//! Talks to the crypto-key `:encrypt`/`:decrypt` REST endpoints. Cloud KMS
//! has no generate-data-key primitive, so generation is synthesized: draw
//! 32 random bytes, then encrypt them.
//!
//! The API frames binary fields as base64 inside JSON bodies; that framing
//! is owned here, at the transport boundary, and is unrelated to the
//! envelope format's own base64.
//!
//! Every `:encrypt` response names the crypto-key *version* that produced
//! the ciphertext; the provider keeps the most recent one, which is the
//! datum historical envelope shortening was derived from.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use zarf_kms_google::{GoogleKmsProvider, StaticTokenProvider};
//!
//! # fn example() -> Result<(), zarf_kms_google::GoogleKmsError> {
//! let tokens = Arc::new(StaticTokenProvider::new("ya29.token"));
//! let provider = GoogleKmsProvider::new(tokens)?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use secrecy::{ExposeSecret, SecretVec};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zarf::error::ProviderError;
use zarf::provider::{random_data_key, DataKeyPair, KmsProvider};
use zeroize::Zeroizing;

/// Production Cloud KMS endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://cloudkms.googleapis.com/v1";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_ATTEMPTS: usize = 2;

/// Errors specific to Cloud KMS operations.
#[derive(Debug, Error)]
pub enum GoogleKmsError {
    /// Cloud KMS rejected the ciphertext or its authenticated data
    #[error("decryption failed")]
    DecryptionFailed,

    /// Credentials were rejected
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Network-level failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Cloud KMS API error
    #[error("cloud kms error ({status}): {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Error message from the response body
        message: String,
    },

    /// Response body could not be interpreted
    #[error("unexpected response: {0}")]
    Response(String),
}

impl From<GoogleKmsError> for ProviderError {
    fn from(err: GoogleKmsError) -> Self {
        match err {
            GoogleKmsError::DecryptionFailed => Self::DecryptionFailed,
            GoogleKmsError::Auth(msg) => Self::Auth(msg),
            GoogleKmsError::Transport(msg) => Self::Transport(msg),
            GoogleKmsError::Api { status, message } => {
                Self::Api(format!("cloud kms error ({status}): {message}"))
            }
            GoogleKmsError::Response(msg) => Self::Response(msg),
        }
    }
}

/// Supplies OAuth2 bearer tokens for Cloud KMS calls.
///
/// Production implementations wrap the metadata server or a service
/// account flow; tests use [`StaticTokenProvider`].
#[async_trait::async_trait]
pub trait AccessTokenProvider: Send + Sync {
    /// Returns a token valid for the next request.
    ///
    /// # Errors
    ///
    /// Returns [`GoogleKmsError::Auth`] if no token can be produced.
    async fn access_token(&self) -> Result<String, GoogleKmsError>;
}

/// A fixed token, for tests and short-lived tools.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    /// Creates a provider that always returns `token`.
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

#[async_trait::async_trait]
impl AccessTokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> Result<String, GoogleKmsError> {
        Ok(self.token.clone())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EncryptRequest<'a> {
    plaintext: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    additional_authenticated_data: Option<&'a str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EncryptResponse {
    name: String,
    ciphertext: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DecryptRequest<'a> {
    ciphertext: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    additional_authenticated_data: Option<&'a str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DecryptResponse {
    plaintext: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<ErrorDetail>,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

/// Google Cloud KMS provider implementation.
pub struct GoogleKmsProvider {
    http: reqwest::Client,
    endpoint: String,
    tokens: Arc<dyn AccessTokenProvider>,
    last_key_version: RwLock<Option<String>>,
}

impl GoogleKmsProvider {
    /// Creates a provider against the production endpoint with default
    /// timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`GoogleKmsError::Transport`] if the HTTP client cannot be
    /// built.
    pub fn new(tokens: Arc<dyn AccessTokenProvider>) -> Result<Self, GoogleKmsError> {
        Self::builder(tokens).build()
    }

    /// Starts building a provider with custom endpoint or timeouts.
    #[must_use]
    pub fn builder(tokens: Arc<dyn AccessTokenProvider>) -> GoogleKmsProviderBuilder {
        GoogleKmsProviderBuilder {
            tokens,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            timeout: DEFAULT_TIMEOUT,
            connect_timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Returns the crypto-key version resource name reported by the most
    /// recent encrypt call, if any.
    #[must_use]
    pub fn last_key_version(&self) -> Option<String> {
        self.last_key_version.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        url: &str,
        body: &impl Serialize,
    ) -> Result<T, GoogleKmsError> {
        let token = self.tokens.access_token().await?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self.http.post(url).bearer_auth(&token).json(body).send().await;

            let response = match result {
                Ok(response) => response,
                Err(_) if attempt < MAX_ATTEMPTS => continue,
                Err(err) => return Err(GoogleKmsError::Transport(err.to_string())),
            };

            let status = response.status();
            if status.is_server_error() && attempt < MAX_ATTEMPTS {
                continue;
            }

            if status.is_success() {
                return response
                    .json::<T>()
                    .await
                    .map_err(|e| GoogleKmsError::Response(e.to_string()));
            }

            let message = response
                .json::<ErrorBody>()
                .await
                .ok()
                .and_then(|body| body.error)
                .map_or_else(|| status.to_string(), |detail| detail.message);

            return Err(match status.as_u16() {
                401 | 403 => GoogleKmsError::Auth(message),
                code => GoogleKmsError::Api { status: code, message },
            });
        }
    }
}

/// Builder for [`GoogleKmsProvider`].
pub struct GoogleKmsProviderBuilder {
    tokens: Arc<dyn AccessTokenProvider>,
    endpoint: String,
    timeout: Duration,
    connect_timeout: Duration,
}

impl GoogleKmsProviderBuilder {
    /// Overrides the API endpoint (used by tests against a local server).
    #[must_use]
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
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
    /// Returns [`GoogleKmsError::Transport`] if the HTTP client cannot be
    /// built.
    pub fn build(self) -> Result<GoogleKmsProvider, GoogleKmsError> {
        let http = reqwest::Client::builder()
            .timeout(self.timeout)
            .connect_timeout(self.connect_timeout)
            .build()
            .map_err(|e| GoogleKmsError::Transport(e.to_string()))?;

        Ok(GoogleKmsProvider {
            http,
            endpoint: self.endpoint,
            tokens: self.tokens,
            last_key_version: RwLock::new(None),
        })
    }
}

#[async_trait::async_trait]
impl KmsProvider for GoogleKmsProvider {
    async fn encrypt(
        &self,
        key_id: &str,
        plaintext: &[u8],
        context: Option<&[u8]>,
    ) -> Result<Vec<u8>, ProviderError> {
        let url = format!("{}/{key_id}:encrypt", self.endpoint);
        let plaintext = Zeroizing::new(STANDARD.encode(plaintext));
        let aad = context.map(|c| STANDARD.encode(c));

        let response: EncryptResponse = self
            .post_json(
                &url,
                &EncryptRequest {
                    plaintext: &plaintext,
                    additional_authenticated_data: aad.as_deref(),
                },
            )
            .await?;

        *self.last_key_version.write().unwrap_or_else(PoisonError::into_inner) =
            Some(response.name);

        let ciphertext = STANDARD
            .decode(&response.ciphertext)
            .map_err(|e| GoogleKmsError::Response(format!("invalid ciphertext encoding: {e}")))?;
        Ok(ciphertext)
    }

    async fn decrypt(
        &self,
        key_id: &str,
        ciphertext: &[u8],
        context: Option<&[u8]>,
    ) -> Result<SecretVec<u8>, ProviderError> {
        let url = format!("{}/{key_id}:decrypt", self.endpoint);
        let ciphertext = STANDARD.encode(ciphertext);
        let aad = context.map(|c| STANDARD.encode(c));

        let response: DecryptResponse = self
            .post_json(
                &url,
                &DecryptRequest {
                    ciphertext: &ciphertext,
                    additional_authenticated_data: aad.as_deref(),
                },
            )
            .await
            .map_err(|err| match err {
                // a 400 means the ciphertext or its authenticated data was
                // rejected; collapsed so callers cannot tell which
                GoogleKmsError::Api { status: 400, .. } => GoogleKmsError::DecryptionFailed,
                other => other,
            })?;

        let plaintext = STANDARD
            .decode(&response.plaintext)
            .map_err(|e| GoogleKmsError::Response(format!("invalid plaintext encoding: {e}")))?;
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
