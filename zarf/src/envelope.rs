//! Versioned envelope wire format for wrapped data keys.
//!
//! The current format is `v<version>:<base64(provider ciphertext)>` and is
//! the only form ever written. Three legacy forms with no version tag are
//! still decoded, disambiguated by content sniffing in a fixed order:
//!
//! - a test-provider ciphertext stored raw,
//! - a `$gc$`-tagged record embedding a shortened Google Cloud key id,
//! - a raw Vault transit ciphertext (`vault:` scheme).
//!
//! Legacy envelopes always imply version 1 and legacy context mode. An
//! unrecognized format is a hard error, never a best-effort guess.

use crate::context::CanonicalMode;
use crate::error::Error;
use crate::router::TEST_KEY_ID;
use base64::engine::general_purpose::STANDARD;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::{alphabet, Engine};

/// Tag prefix of the legacy Google Cloud envelope form.
const LEGACY_GOOGLE_TAG: &str = "$gc$";

/// Prefix of a raw Vault transit ciphertext.
const LEGACY_VAULT_PREFIX: &str = "vault:";

/// Prefix of a raw test-provider ciphertext.
pub(crate) const LEGACY_TEST_PREFIX: &str = "insecure-data-key";

/// Fixed path-segment labels stripped from Google key ids at write time and
/// reinserted at their original even-numbered positions on decode.
const GOOGLE_PATH_LABELS: [&str; 4] = ["projects", "locations", "keyRings", "cryptoKeys"];

// Legacy writers emitted line-wrapped base64 with optional padding, so the
// decode side must accept both that and the strict form written today.
const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// A decoded envelope, tagged by the format that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedEnvelope {
    /// Current format: explicit version tag, no sniffing required.
    Current {
        /// Version number embedded in the envelope
        version: u32,
        /// Provider ciphertext
        ciphertext: Vec<u8>,
    },
    /// Legacy raw test-provider ciphertext.
    LegacyTest {
        /// Provider ciphertext (the stored string itself)
        ciphertext: Vec<u8>,
    },
    /// Legacy Google Cloud form with an embedded, shortened key id.
    LegacyGoogle {
        /// Full key identifier reconstructed from the shortened form
        key_id: String,
        /// Provider ciphertext
        ciphertext: Vec<u8>,
    },
    /// Legacy raw Vault transit ciphertext.
    LegacyVault {
        /// Provider ciphertext (the stored string itself)
        ciphertext: Vec<u8>,
    },
}

impl ParsedEnvelope {
    /// Returns the key version this envelope was written under. Legacy
    /// envelopes always imply version 1.
    #[must_use]
    pub const fn version(&self) -> u32 {
        match self {
            Self::Current { version, .. } => *version,
            _ => 1,
        }
    }

    /// Returns the canonicalization mode the envelope's context was bound
    /// with.
    #[must_use]
    pub const fn context_mode(&self) -> CanonicalMode {
        match self {
            Self::Current { .. } => CanonicalMode::Normalized,
            _ => CanonicalMode::Legacy,
        }
    }

    /// Returns true for any of the three pre-versioning forms.
    #[must_use]
    pub const fn is_legacy(&self) -> bool {
        !matches!(self, Self::Current { .. })
    }

    /// Returns the key identifier embedded in the envelope, if the format
    /// carries one.
    #[must_use]
    pub fn embedded_key_id(&self) -> Option<&str> {
        match self {
            Self::LegacyGoogle { key_id, .. } => Some(key_id),
            Self::LegacyTest { .. } => Some(TEST_KEY_ID),
            _ => None,
        }
    }

    /// Returns the provider ciphertext.
    #[must_use]
    pub fn ciphertext(&self) -> &[u8] {
        match self {
            Self::Current { ciphertext, .. }
            | Self::LegacyTest { ciphertext }
            | Self::LegacyGoogle { ciphertext, .. }
            | Self::LegacyVault { ciphertext } => ciphertext,
        }
    }
}

/// Encodes a provider ciphertext as a current-format envelope.
#[must_use]
pub fn encode(version: u32, ciphertext: &[u8]) -> String {
    format!("v{version}:{}", STANDARD.encode(ciphertext))
}

/// Decodes a stored envelope string, trying each known format in order.
///
/// # Errors
///
/// Returns [`Error::MalformedEnvelope`] if the string matches no known
/// format, or matches one structurally but carries an undecodable payload.
pub fn decode(envelope: &str) -> Result<ParsedEnvelope, Error> {
    if let Some((version, payload)) = parse_current(envelope) {
        let ciphertext = decode64(payload)
            .map_err(|e| Error::MalformedEnvelope(format!("invalid base64 payload: {e}")))?;
        return Ok(ParsedEnvelope::Current { version, ciphertext });
    }

    if envelope.starts_with(LEGACY_TEST_PREFIX) {
        return Ok(ParsedEnvelope::LegacyTest { ciphertext: envelope.as_bytes().to_vec() });
    }

    if envelope.starts_with(LEGACY_GOOGLE_TAG) {
        return decode_legacy_google(envelope);
    }

    if envelope.starts_with(LEGACY_VAULT_PREFIX) {
        return Ok(ParsedEnvelope::LegacyVault { ciphertext: envelope.as_bytes().to_vec() });
    }

    Err(Error::MalformedEnvelope("unrecognized envelope format".to_string()))
}

/// Parses a `v<digits>:` prefix, returning the version and the payload
/// after the colon.
fn parse_current(envelope: &str) -> Option<(u32, &str)> {
    let rest = envelope.strip_prefix('v')?;
    let colon = rest.find(':')?;
    let (digits, payload) = rest.split_at(colon);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let version = digits.parse().ok()?;
    Some((version, &payload[1..]))
}

/// Decodes the `$gc$`-tagged legacy form: a `$`-delimited 4-field record of
/// tag, reserved field, shortened key id, and ciphertext.
///
/// The shortened id kept only the variable path segments of the key version
/// resource name; the fixed labels are reinserted at their original
/// positions. The trailing `cryptoKeyVersions` segment, if present, is
/// dropped so the reconstructed id names the crypto key itself.
fn decode_legacy_google(envelope: &str) -> Result<ParsedEnvelope, Error> {
    let mut fields = envelope.splitn(4, '$');
    let (Some(""), Some("gc"), Some(short_key_id), Some(ciphertext)) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        return Err(Error::MalformedEnvelope("truncated legacy record".to_string()));
    };

    let short_key_id = decode64(short_key_id)
        .map_err(|e| Error::MalformedEnvelope(format!("invalid key id encoding: {e}")))?;
    let short_key_id = String::from_utf8(short_key_id)
        .map_err(|_| Error::MalformedEnvelope("key id is not UTF-8".to_string()))?;

    let segments: Vec<&str> = short_key_id.split('/').collect();
    if segments.len() < GOOGLE_PATH_LABELS.len() {
        return Err(Error::MalformedEnvelope(format!(
            "shortened key id has {} segments (need {})",
            segments.len(),
            GOOGLE_PATH_LABELS.len()
        )));
    }

    let mut parts = Vec::with_capacity(GOOGLE_PATH_LABELS.len() * 2);
    for (label, segment) in GOOGLE_PATH_LABELS.iter().zip(segments.iter()) {
        parts.push(*label);
        parts.push(*segment);
    }
    let key_id = parts.join("/");

    let ciphertext = decode64(ciphertext)
        .map_err(|e| Error::MalformedEnvelope(format!("invalid base64 payload: {e}")))?;

    Ok(ParsedEnvelope::LegacyGoogle { key_id, ciphertext })
}

/// Base64-decodes, tolerating the line wrapping and loose padding of
/// historical writers.
fn decode64(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    if input.bytes().any(|b| b.is_ascii_whitespace()) {
        let cleaned: String = input.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        LENIENT.decode(cleaned)
    } else {
        LENIENT.decode(input)
    }
}
