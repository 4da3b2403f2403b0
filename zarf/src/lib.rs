//! # `Zarf`
//!
//! Envelope encryption key management: generate, wrap, and unwrap
//! per-record data keys through a remote KMS, so application data is
//! encrypted locally while only the small wrapped key ever reaches the
//! slow, audited KMS API.
//!
//! ## Features
//!
//! - Versioned, self-describing ciphertext envelopes with key rotation
//! - Syntax-based routing of key identifiers to provider backends
//! - Byte-stable encryption-context canonicalization across providers
//! - Backward-compatible decoding of pre-versioning envelope formats
//! - Per-instance data-key caching with reload invalidation
//! - Local test provider, no cloud credentials required
//!
//! Backends ship as separate crates (`zarf-kms-aws`, `zarf-kms-google`,
//! `zarf-kms-vault`) and plug into a [`provider::ProviderRegistry`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use zarf::prelude::*;
//!
//! let registry = Arc::new(ProviderRegistry::new()
//!     .register(ProviderKind::Aws, Arc::new(aws_provider)));
//! let keyring = Keyring::new(registry)
//!     .declare(KeySlot::new("kms_key", "alias/app-key")
//!         .with_context_fn(|user: &User, _v| {
//!             EncryptionContext::new().with("user_id", user.id)
//!         }));
//!
//! let data_key = keyring.data_key(&mut user, &cache, "kms_key").await?;
//! ```

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod audit;
pub mod context;
pub mod envelope;
pub mod error;
pub mod keybox;
pub mod keyring;
pub mod provider;
pub mod router;
pub mod test_provider;

pub mod prelude {
    //! Convenience re-exports for common use.
    pub use crate::context::{CanonicalMode, ContextValue, EncryptionContext};
    pub use crate::envelope::ParsedEnvelope;
    pub use crate::error::{Error, ProviderError};
    pub use crate::keybox::KeyBox;
    pub use crate::keyring::{DataKeyCache, KeySlot, Keyring, Record};
    pub use crate::provider::{KmsProvider, ProviderRegistry};
    pub use crate::router::{ProviderKind, TEST_KEY_ID};
}
