//! AWS KMS provider for Zarf.
//!
//! The only backend with a native generate-data-key operation; encrypt,
//! decrypt, and generation all go straight to the KMS API with a 256-bit
//! AES key spec.
//!
//! # Example
//!
//! ```rust,no_run
//! use zarf_kms_aws::AwsKmsProvider;
//! use zarf::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let provider = AwsKmsProvider::new().await;
//!
//! let registry = ProviderRegistry::new()
//!     .register(ProviderKind::Aws, Arc::new(provider));
//! # }
//! ```
//!
//! # AWS Configuration
//!
//! The provider uses the AWS SDK's default credential chain:
//! - Environment variables (AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY)
//! - AWS credentials file (~/.aws/credentials)
//! - IAM instance profile (for EC2)
//! - ECS task role
//! - Web identity token (for EKS)
//!
//! Transport retries are bounded to two attempts with two-second
//! connect/read timeouts, and are disabled entirely for data-key
//! generation so one logical write never mints two keys.

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use std::collections::HashMap;
use std::time::Duration;

use aws_config::retry::RetryConfig;
use aws_config::timeout::TimeoutConfig;
use aws_config::BehaviorVersion;
use aws_sdk_kms::error::{DisplayErrorContext, SdkError};
use aws_sdk_kms::primitives::Blob;
use aws_sdk_kms::types::DataKeySpec;
use aws_sdk_kms::Client as KmsClient;
use secrecy::SecretVec;
use thiserror::Error;
use zarf::error::ProviderError;
use zarf::provider::{DataKeyPair, KmsProvider};

/// Errors specific to AWS KMS operations.
#[derive(Debug, Error)]
pub enum AwsKmsError {
    /// KMS rejected the ciphertext or its encryption context
    #[error("invalid ciphertext")]
    InvalidCiphertext,

    /// KMS API error
    #[error("AWS KMS error: {0}")]
    Api(String),

    /// Network-level failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Response missing an expected field
    #[error("KMS response missing {0}")]
    MissingField(&'static str),

    /// Encryption context could not be converted for the KMS API
    #[error("invalid encryption context: {0}")]
    Context(String),
}

impl From<AwsKmsError> for ProviderError {
    fn from(err: AwsKmsError) -> Self {
        match err {
            AwsKmsError::InvalidCiphertext => Self::DecryptionFailed,
            AwsKmsError::Api(msg) => Self::Api(msg),
            AwsKmsError::Transport(msg) => Self::Transport(msg),
            AwsKmsError::MissingField(field) => Self::Response(format!("missing {field}")),
            AwsKmsError::Context(msg) => Self::Api(msg),
        }
    }
}

/// AWS KMS provider implementation.
///
/// Stateless beyond the SDK client; key identifiers arrive per call from
/// the routing layer.
pub struct AwsKmsProvider {
    client: KmsClient,
}

impl AwsKmsProvider {
    /// Creates a provider with default AWS configuration and the bounded
    /// retry/timeout policy described in the crate docs.
    ///
    /// Uses AWS SDK's default credential and region resolution.
    pub async fn new() -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest())
            .retry_config(RetryConfig::standard().with_max_attempts(2))
            .timeout_config(
                TimeoutConfig::builder()
                    .connect_timeout(Duration::from_secs(2))
                    .read_timeout(Duration::from_secs(2))
                    .build(),
            )
            .load()
            .await;

        Self { client: KmsClient::new(&config) }
    }

    /// Creates a provider from a preconfigured client. The caller owns
    /// credential, retry, and timeout policy.
    #[must_use]
    pub const fn from_client(client: KmsClient) -> Self {
        Self { client }
    }
}

/// Converts canonical context bytes into the string map the KMS API
/// accepts. An empty context is not bound, matching a missing one.
fn context_map(context: Option<&[u8]>) -> Result<Option<HashMap<String, String>>, AwsKmsError> {
    let Some(bytes) = context else { return Ok(None) };

    let parsed: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(bytes)
        .map_err(|e| AwsKmsError::Context(format!("not a JSON object: {e}")))?;
    if parsed.is_empty() {
        return Ok(None);
    }

    let mut map = HashMap::with_capacity(parsed.len());
    for (key, value) in parsed {
        let value = match value {
            serde_json::Value::String(s) => s,
            serde_json::Value::Number(n) => n.to_string(),
            other => {
                return Err(AwsKmsError::Context(format!(
                    "value for {key:?} must be a string or integer, got {other}"
                )))
            }
        };
        map.insert(key, value);
    }
    Ok(Some(map))
}

fn map_transport_error<E, R>(err: &SdkError<E, R>) -> Option<AwsKmsError>
where
    E: std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            Some(AwsKmsError::Transport(DisplayErrorContext(err).to_string()))
        }
        _ => None,
    }
}

#[async_trait::async_trait]
impl KmsProvider for AwsKmsProvider {
    async fn encrypt(
        &self,
        key_id: &str,
        plaintext: &[u8],
        context: Option<&[u8]>,
    ) -> Result<Vec<u8>, ProviderError> {
        let response = self
            .client
            .encrypt()
            .key_id(key_id)
            .plaintext(Blob::new(plaintext.to_vec()))
            .set_encryption_context(context_map(context)?)
            .send()
            .await
            .map_err(|err| {
                map_transport_error(&err)
                    .unwrap_or_else(|| AwsKmsError::Api(DisplayErrorContext(&err).to_string()))
            })?;

        let ciphertext = response
            .ciphertext_blob()
            .ok_or(AwsKmsError::MissingField("ciphertext blob"))?;
        Ok(ciphertext.as_ref().to_vec())
    }

    async fn decrypt(
        &self,
        _key_id: &str,
        ciphertext: &[u8],
        context: Option<&[u8]>,
    ) -> Result<SecretVec<u8>, ProviderError> {
        // the ciphertext blob names its own key; no key id is sent
        let response = self
            .client
            .decrypt()
            .ciphertext_blob(Blob::new(ciphertext.to_vec()))
            .set_encryption_context(context_map(context)?)
            .send()
            .await
            .map_err(|err| {
                if let Some(transport) = map_transport_error(&err) {
                    return transport;
                }
                match &err {
                    SdkError::ServiceError(ctx)
                        if ctx.err().is_invalid_ciphertext_exception() =>
                    {
                        AwsKmsError::InvalidCiphertext
                    }
                    _ => AwsKmsError::Api(DisplayErrorContext(&err).to_string()),
                }
            })?;

        let plaintext = response.plaintext().ok_or(AwsKmsError::MissingField("plaintext"))?;
        Ok(SecretVec::new(plaintext.as_ref().to_vec()))
    }

    async fn generate_data_key(
        &self,
        key_id: &str,
        context: Option<&[u8]>,
    ) -> Result<DataKeyPair, ProviderError> {
        let response = self
            .client
            .generate_data_key()
            .key_id(key_id)
            .key_spec(DataKeySpec::Aes256)
            .set_encryption_context(context_map(context)?)
            // never retried: a retry that raced a slow success would mint
            // two different keys for one logical write
            .customize()
            .config_override(
                aws_sdk_kms::config::Builder::default().retry_config(RetryConfig::disabled()),
            )
            .send()
            .await
            .map_err(|err| {
                map_transport_error(&err)
                    .unwrap_or_else(|| AwsKmsError::Api(DisplayErrorContext(&err).to_string()))
            })?;

        let plaintext = response.plaintext().ok_or(AwsKmsError::MissingField("plaintext"))?;
        let ciphertext = response
            .ciphertext_blob()
            .ok_or(AwsKmsError::MissingField("ciphertext blob"))?;

        Ok((SecretVec::new(plaintext.as_ref().to_vec()), ciphertext.as_ref().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_map_coerces_values() {
        let map = context_map(Some(br#"{"user_id":"123","version":1}"#)).unwrap().unwrap();
        assert_eq!(map.get("user_id").map(String::as_str), Some("123"));
        assert_eq!(map.get("version").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_context_map_empty_is_unbound() {
        assert!(context_map(None).unwrap().is_none());
        assert!(context_map(Some(b"{}")).unwrap().is_none());
    }

    #[test]
    fn test_context_map_rejects_non_scalar_values() {
        let result = context_map(Some(br#"{"nested":{"a":1}}"#));
        assert!(matches!(result, Err(AwsKmsError::Context(_))));
    }

    #[test]
    fn test_context_map_rejects_non_object() {
        let result = context_map(Some(b"[1,2,3]"));
        assert!(matches!(result, Err(AwsKmsError::Context(_))));
    }

    #[test]
    fn test_invalid_ciphertext_collapses_to_decryption_failed() {
        let err: ProviderError = AwsKmsError::InvalidCiphertext.into();
        assert!(matches!(err, ProviderError::DecryptionFailed));
    }

    #[test]
    fn test_transport_error_stays_transient() {
        let err: ProviderError = AwsKmsError::Transport("timed out".to_string()).into();
        assert!(matches!(err, ProviderError::Transport(_)));
    }
}
