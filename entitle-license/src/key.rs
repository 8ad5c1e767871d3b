//! License token parsing and Ed25519 signature verification.
//!
//! Tokens use the format: `base64url(payload).base64url(signature)`
//!
//! The payload is a JSON object containing:
//! - `fingerprint`: machine fingerprint the license is bound to
//! - `issued_at`, `expires_at`: RFC 3339 strings or Unix seconds
//! - `license_id`: unique license identifier
//! - `customer_id`, `edition`, `license_version`: optional
//!
//! The signature covers the raw decoded payload bytes. Syntax is checked in
//! full before any cryptographic work is done.

use crate::error::RejectReason;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{SIGNATURE_LENGTH, Signature, VerifyingKey};
use serde::{Deserialize, Serialize};

/// Payload fields a token must carry, in the order they are checked.
pub const REQUIRED_FIELDS: [&str; 4] = ["fingerprint", "issued_at", "expires_at", "license_id"];

/// Default limit on the payload segment, in characters.
pub const DEFAULT_MAX_PAYLOAD_SEGMENT: usize = 4096;

/// Length of an unpadded base64url Ed25519 signature.
const SIGNATURE_SEGMENT_LEN: usize = (SIGNATURE_LENGTH * 4).div_ceil(3);

/// The decoded license payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicensePayload {
    /// Machine fingerprint the license is bound to.
    pub fingerprint: String,
    /// When the license was issued.
    #[serde(with = "flexible_time")]
    pub issued_at: DateTime<Utc>,
    /// When the license stops being valid.
    #[serde(with = "flexible_time")]
    pub expires_at: DateTime<Utc>,
    /// Unique license identifier.
    pub license_id: String,
    /// Customer reference; numeric ids are kept as strings.
    #[serde(default, deserialize_with = "string_or_number")]
    pub customer_id: Option<String>,
    /// Product edition.
    #[serde(default)]
    pub edition: Option<String>,
    /// Payload schema version.
    #[serde(default = "default_license_version")]
    pub license_version: u32,
}

fn default_license_version() -> u32 {
    1
}

/// Verifies license tokens against one public key.
#[derive(Debug, Clone)]
pub struct LicenseTokenVerifier {
    key: VerifyingKey,
    max_payload_segment: usize,
    not_before_grace: Duration,
}

impl LicenseTokenVerifier {
    /// Creates a verifier with the default limits.
    pub fn new(key: VerifyingKey) -> Self {
        Self {
            key,
            max_payload_segment: DEFAULT_MAX_PAYLOAD_SEGMENT,
            not_before_grace: Duration::hours(24),
        }
    }

    /// Overrides the payload size limit and the `issued_at` grace window.
    #[must_use]
    pub fn with_limits(mut self, max_payload_segment: usize, not_before_grace: Duration) -> Self {
        self.max_payload_segment = max_payload_segment;
        self.not_before_grace = not_before_grace;
        self
    }

    /// Decodes, then checks the machine binding and validity window.
    pub fn verify(
        &self,
        token: &str,
        fingerprint: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<LicensePayload, RejectReason> {
        let payload = self.decode(token)?;
        self.check_binding(&payload, fingerprint, now)?;
        Ok(payload)
    }

    /// Validates syntax, verifies the signature and parses the payload.
    pub fn decode(&self, token: &str) -> Result<LicensePayload, RejectReason> {
        let token = normalize(token);

        if !token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(RejectReason::Malformed);
        }

        let mut parts = token.split('.');
        let (Some(payload_b64), Some(signature_b64), None) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(RejectReason::Malformed);
        };

        if payload_b64.is_empty()
            || signature_b64.is_empty()
            || payload_b64.len() > self.max_payload_segment
            || signature_b64.len() > SIGNATURE_SEGMENT_LEN
        {
            return Err(RejectReason::Malformed);
        }

        let payload_bytes = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| RejectReason::Malformed)?;
        let signature_bytes = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| RejectReason::Malformed)?;
        let signature =
            Signature::from_slice(&signature_bytes).map_err(|_| RejectReason::Malformed)?;

        self.key
            .verify_strict(&payload_bytes, &signature)
            .map_err(|_| RejectReason::BadSignature)?;

        parse_payload(&payload_bytes)
    }

    /// Checks that `payload` is bound to `fingerprint` and valid at `now`.
    pub fn check_binding(
        &self,
        payload: &LicensePayload,
        fingerprint: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), RejectReason> {
        let Some(fingerprint) = fingerprint else {
            return Err(RejectReason::FingerprintUnavailable);
        };
        if !payload.fingerprint.eq_ignore_ascii_case(fingerprint) {
            return Err(RejectReason::FingerprintMismatch);
        }
        if now < payload.issued_at - self.not_before_grace {
            return Err(RejectReason::NotYetValid);
        }
        if now > payload.expires_at {
            return Err(RejectReason::Expired);
        }
        Ok(())
    }
}

/// Cleans up a pasted token.
///
/// Drops whitespace and zero-width characters, maps Unicode dashes to `-`
/// and fullwidth or ideographic full stops to `.`.
pub fn normalize(token: &str) -> String {
    token
        .chars()
        .filter(|c| !c.is_whitespace() && !is_zero_width(*c))
        .map(|c| match c {
            '\u{2010}'..='\u{2015}' | '\u{2212}' | '\u{FE58}' | '\u{FE63}' | '\u{FF0D}' => '-',
            '\u{3002}' | '\u{FF0E}' | '\u{FF61}' => '.',
            other => other,
        })
        .collect()
}

fn is_zero_width(c: char) -> bool {
    matches!(c, '\u{200B}'..='\u{200D}' | '\u{2060}' | '\u{FEFF}' | '\u{00AD}')
}

fn parse_payload(bytes: &[u8]) -> Result<LicensePayload, RejectReason> {
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|_| RejectReason::InvalidPayload)?;
    let object = value.as_object().ok_or(RejectReason::InvalidPayload)?;

    for field in REQUIRED_FIELDS {
        let present = match object.get(field) {
            None | Some(serde_json::Value::Null) => false,
            Some(serde_json::Value::String(s)) => !s.trim().is_empty(),
            Some(_) => true,
        };
        if !present {
            return Err(RejectReason::MissingField(field));
        }
    }

    serde_json::from_value(value).map_err(|_| RejectReason::InvalidPayload)
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s)),
        Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

/// Timestamps as RFC 3339 strings or Unix seconds (milliseconds above 1e11).
mod flexible_time {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    const MILLIS_THRESHOLD: i64 = 100_000_000_000;

    pub fn serialize<S: Serializer>(t: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&t.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        match serde_json::Value::deserialize(deserializer)? {
            serde_json::Value::String(s) => match s.trim().parse::<i64>() {
                Ok(n) => from_number(n),
                Err(_) => DateTime::parse_from_rfc3339(s.trim())
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(serde::de::Error::custom),
            },
            serde_json::Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .ok_or_else(|| serde::de::Error::custom("timestamp out of range"))
                .and_then(from_number),
            other => Err(serde::de::Error::custom(format!(
                "expected timestamp, got {other}"
            ))),
        }
    }

    fn from_number<E: serde::de::Error>(n: i64) -> Result<DateTime<Utc>, E> {
        let t = if n.abs() >= MILLIS_THRESHOLD {
            DateTime::from_timestamp_millis(n)
        } else {
            DateTime::from_timestamp(n, 0)
        };
        t.ok_or_else(|| E::custom("timestamp out of range"))
    }
}
