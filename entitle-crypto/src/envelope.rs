//! Versioned sealed envelopes for small JSON state files.
//!
//! An envelope carries the KDF salt, the AEAD nonce and the ciphertext with
//! its tag appended. The key is derived by the caller from the salt found in
//! the envelope, so the envelope itself never holds key material.
//!
//! Version 2 binds the ciphertext to an associated-data string built from a
//! scope and the machine fingerprint hash. Version 1 envelopes were sealed
//! without associated data; they can still be opened once through
//! [`open_any`] so the caller can re-seal them under the current version.

use crate::cipher::{self, EncryptedData, NONCE_SIZE};
use crate::error::{CryptoError, CryptoResult};
use crate::key::{DerivedKey, SALT_SIZE, Salt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Version written by [`seal`].
pub const ENVELOPE_VERSION: u8 = 2;

/// Version of envelopes sealed without associated data.
pub const LEGACY_ENVELOPE_VERSION: u8 = 1;

/// Associated data binding an envelope to a purpose and a machine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Aad(String);

impl Aad {
    /// Builds the associated data for `scope` on the machine whose
    /// fingerprint hashes to `fingerprint_hash`.
    pub fn new(scope: &str, fingerprint_hash: &str) -> Self {
        Self(format!("entitle/{scope}/v{ENVELOPE_VERSION}|{fingerprint_hash}"))
    }

    /// Returns the associated data bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

/// An encrypted, authenticated JSON value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedEnvelope {
    /// Envelope format version.
    pub version: u8,
    /// Salt the sealing key was derived with.
    #[serde(with = "b64")]
    pub salt: Vec<u8>,
    /// AEAD nonce.
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    /// Ciphertext with the authentication tag appended.
    #[serde(with = "b64")]
    pub ciphertext_and_tag: Vec<u8>,
}

impl SealedEnvelope {
    /// Returns the salt the key for this envelope must be derived with.
    pub fn salt(&self) -> CryptoResult<Salt> {
        Salt::from_slice(&self.salt)
    }

    /// Serializes the envelope for storage.
    pub fn to_bytes(&self) -> CryptoResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parses an envelope read from storage.
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn encrypted_data(&self) -> CryptoResult<EncryptedData> {
        let nonce: [u8; NONCE_SIZE] = self.nonce.as_slice().try_into().map_err(|_| {
            CryptoError::InvalidNonceLength {
                expected: NONCE_SIZE,
                actual: self.nonce.len(),
            }
        })?;
        Ok(EncryptedData {
            nonce,
            ciphertext: self.ciphertext_and_tag.clone(),
        })
    }
}

/// A value recovered from an envelope.
#[derive(Debug)]
pub struct Opened<T> {
    /// The decrypted value.
    pub value: T,
    /// True when the envelope used an older format and should be re-sealed.
    pub needs_reseal: bool,
}

/// Seals `value` as JSON under `key`, bound to `aad`.
///
/// `salt` must be the salt `key` was derived with; it is recorded in the
/// envelope so the key can be re-derived on read.
pub fn seal<T: Serialize>(
    value: &T,
    key: &DerivedKey,
    salt: &Salt,
    aad: &Aad,
) -> CryptoResult<SealedEnvelope> {
    let plaintext = serde_json::to_vec(value)?;
    let encrypted = cipher::encrypt(key, &plaintext, aad.as_bytes())?;

    Ok(SealedEnvelope {
        version: ENVELOPE_VERSION,
        salt: salt.as_bytes().to_vec(),
        nonce: encrypted.nonce.to_vec(),
        ciphertext_and_tag: encrypted.ciphertext,
    })
}

/// Opens a current-version envelope.
///
/// Any failure (bad tag, wrong associated data, JSON that does not match
/// `T`, legacy or unknown version) is an error.
pub fn open<T: DeserializeOwned>(
    envelope: &SealedEnvelope,
    key: &DerivedKey,
    aad: &Aad,
) -> CryptoResult<T> {
    if envelope.version != ENVELOPE_VERSION {
        return Err(CryptoError::UnsupportedVersion(envelope.version));
    }
    decrypt_json(envelope, key, aad.as_bytes())
}

/// Opens a current or legacy envelope.
///
/// Legacy envelopes are decrypted without associated data and reported with
/// `needs_reseal` so the caller can migrate them.
pub fn open_any<T: DeserializeOwned>(
    envelope: &SealedEnvelope,
    key: &DerivedKey,
    aad: &Aad,
) -> CryptoResult<Opened<T>> {
    match envelope.version {
        ENVELOPE_VERSION => Ok(Opened {
            value: decrypt_json(envelope, key, aad.as_bytes())?,
            needs_reseal: false,
        }),
        LEGACY_ENVELOPE_VERSION => Ok(Opened {
            value: decrypt_json(envelope, key, &[])?,
            needs_reseal: true,
        }),
        other => Err(CryptoError::UnsupportedVersion(other)),
    }
}

/// Seals `value` in the legacy format, without associated data.
///
/// Only exists so migrations can be exercised; new state always uses [`seal`].
pub fn seal_legacy<T: Serialize>(
    value: &T,
    key: &DerivedKey,
    salt: &Salt,
) -> CryptoResult<SealedEnvelope> {
    let plaintext = serde_json::to_vec(value)?;
    let encrypted = cipher::encrypt(key, &plaintext, &[])?;

    Ok(SealedEnvelope {
        version: LEGACY_ENVELOPE_VERSION,
        salt: salt.as_bytes().to_vec(),
        nonce: encrypted.nonce.to_vec(),
        ciphertext_and_tag: encrypted.ciphertext,
    })
}

fn decrypt_json<T: DeserializeOwned>(
    envelope: &SealedEnvelope,
    key: &DerivedKey,
    aad: &[u8],
) -> CryptoResult<T> {
    if envelope.salt.len() != SALT_SIZE {
        return Err(CryptoError::InvalidSaltLength {
            expected: SALT_SIZE,
            actual: envelope.salt.len(),
        });
    }
    let plaintext = cipher::decrypt(key, &envelope.encrypted_data()?, aad)?;
    serde_json::from_slice(&plaintext)
        .map_err(|e| CryptoError::Decryption(format!("invalid JSON after decrypt: {e}")))
}

mod b64 {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
