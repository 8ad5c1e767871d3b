//! Error types for the licensing module.
//!
//! [`LicenseError`] covers internal failures (storage, configuration,
//! crypto). Policy decisions about a token are not errors: they are reported
//! as a [`RejectReason`] so callers can render a distinct message per code.

use entitle_crypto::CryptoError;
use serde::{Serialize, Serializer};
use thiserror::Error;

/// Licensing-specific errors.
#[derive(Debug, Error)]
pub enum LicenseError {
    /// Sealing, opening or key derivation failed.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration could not be applied.
    #[error("configuration error: {0}")]
    Config(String),

    /// A configured public key could not be decoded.
    #[error("invalid public key from {source_name}: {reason}")]
    InvalidPublicKey {
        /// Which configured source held the key.
        source_name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The OS data-protection facility refused an operation.
    #[error("secure storage error: {0}")]
    SecureStorage(String),

    /// Support operations are disabled by configuration.
    #[error("support tools are disabled")]
    SupportToolsDisabled,

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for license operations.
pub type LicenseResult<T> = Result<T, LicenseError>;

/// Why a token or an activation was refused.
///
/// The [`code`](Self::code) strings are stable and surfaced verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
pub enum RejectReason {
    /// The token failed syntactic validation.
    #[error("license key is malformed")]
    Malformed,

    /// The Ed25519 signature does not verify.
    #[error("license key signature is invalid")]
    BadSignature,

    /// A required payload field is absent.
    #[error("license payload is missing `{0}`")]
    MissingField(&'static str),

    /// The payload is not a JSON object or a field has the wrong type.
    #[error("license payload is invalid")]
    InvalidPayload,

    /// The license is bound to another machine.
    #[error("license is bound to a different machine")]
    FingerprintMismatch,

    /// The machine fingerprint could not be determined.
    #[error("machine identity is unavailable")]
    FingerprintUnavailable,

    /// `issued_at` lies beyond the clock-skew grace window.
    #[error("license is not yet valid")]
    NotYetValid,

    /// `expires_at` has passed.
    #[error("license has expired")]
    Expired,

    /// The license id was already spent on this machine.
    #[error("license has already been used")]
    LicenseConsumed,

    /// Too many activation attempts.
    #[error("too many activation attempts")]
    RateLimited,

    /// The activated record could not be persisted.
    #[error("license could not be saved")]
    StorageFailed,

    /// The stored record's integrity stamp does not match.
    #[error("stored license failed its integrity check")]
    TamperHmac,

    /// The clock is far behind the last time the license was seen.
    #[error("system clock was moved backwards")]
    ClockRollback,
}

impl RejectReason {
    /// Returns the stable snake_case code for this reason.
    #[must_use]
    pub fn code(&self) -> String {
        match self {
            Self::Malformed => "malformed".to_string(),
            Self::BadSignature => "bad_signature".to_string(),
            Self::MissingField(field) => format!("missing_{field}"),
            Self::InvalidPayload => "invalid_payload".to_string(),
            Self::FingerprintMismatch => "fingerprint_mismatch".to_string(),
            Self::FingerprintUnavailable => "fingerprint_unavailable".to_string(),
            Self::NotYetValid => "not_yet_valid".to_string(),
            Self::Expired => "expired".to_string(),
            Self::LicenseConsumed => "license_consumed".to_string(),
            Self::RateLimited => "rate_limited".to_string(),
            Self::StorageFailed => "storage_failed".to_string(),
            Self::TamperHmac => "tamper_hmac".to_string(),
            Self::ClockRollback => "clock_rollback".to_string(),
        }
    }
}

impl Serialize for RejectReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.code())
    }
}
