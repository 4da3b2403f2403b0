//! Key identifier routing.
//!
//! A key identifier's syntax alone determines which provider owns it; there
//! is no registry lookup and no network call. Anything that is not the test
//! sentinel, a Vault transit path, or a Google Cloud resource path is an
//! AWS key (id, ARN, or alias).

use crate::error::Error;

/// Reserved key identifier for the local, insecure test provider.
pub const TEST_KEY_ID: &str = "insecure-test-key";

/// Scheme prefix for Vault transit keys, e.g. `vault/my-key`.
pub const VAULT_KEY_PREFIX: &str = "vault/";

/// Resource-path prefix for Google Cloud KMS keys, e.g.
/// `projects/p/locations/l/keyRings/r/cryptoKeys/k`.
pub const GOOGLE_KEY_PREFIX: &str = "projects/";

/// The provider family a key identifier routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    /// Local test provider (no network)
    Test,
    /// HashiCorp Vault transit engine
    Vault,
    /// Google Cloud KMS
    Google,
    /// AWS KMS (the default)
    Aws,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Test => "test",
            Self::Vault => "vault",
            Self::Google => "google",
            Self::Aws => "aws",
        };
        f.write_str(name)
    }
}

/// Routes a key identifier to its provider by syntax.
///
/// # Errors
///
/// Returns [`Error::Configuration`] for an empty identifier. Absence of a
/// key id is always an error, never a default to the test provider.
pub fn route(key_id: &str) -> Result<ProviderKind, Error> {
    if key_id.is_empty() {
        return Err(Error::Configuration("missing key id".to_string()));
    }

    let kind = if key_id == TEST_KEY_ID {
        ProviderKind::Test
    } else if key_id.starts_with(VAULT_KEY_PREFIX) {
        ProviderKind::Vault
    } else if key_id.starts_with(GOOGLE_KEY_PREFIX) {
        ProviderKind::Google
    } else {
        ProviderKind::Aws
    };

    Ok(kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_test_sentinel() {
        assert_eq!(route("insecure-test-key").unwrap(), ProviderKind::Test);
    }

    #[test]
    fn test_route_vault() {
        assert_eq!(route("vault/my-key").unwrap(), ProviderKind::Vault);
    }

    #[test]
    fn test_route_google() {
        let key_id = "projects/p/locations/l/keyRings/r/cryptoKeys/k";
        assert_eq!(route(key_id).unwrap(), ProviderKind::Google);
    }

    #[test]
    fn test_route_aws_default() {
        assert_eq!(
            route("arn:aws:kms:us-east-1:123456789012:key/abc").unwrap(),
            ProviderKind::Aws
        );
        assert_eq!(route("alias/my-key").unwrap(), ProviderKind::Aws);
    }

    #[test]
    fn test_route_prefix_must_match_exactly() {
        // only the exact sentinel routes to the test provider
        assert_eq!(route("insecure-test-key-2").unwrap(), ProviderKind::Aws);
    }

    #[test]
    fn test_route_empty_is_error() {
        assert!(matches!(route(""), Err(Error::Configuration(_))));
    }
}
