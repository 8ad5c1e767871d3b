//! Activated license records and their storage.
//!
//! A record is sealed per user and mirrored machine-wide. The mirror is
//! sealed with the machine key ring, so it stays readable after the per-user
//! secret or profile is lost; a restored mirror is always re-verified before
//! it is trusted.

use crate::error::{LicenseError, LicenseResult};
use crate::key::LicensePayload;
use crate::keys::KeyRing;
use crate::storage::{self, ReadOutcome};
use chrono::{DateTime, Utc};
use entitle_crypto::{Aad, SealedEnvelope, hmac_hex, sha256_hex, verify_hmac_hex};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

const LICENSE_SCOPE: &str = "license";
const MIRROR_SCOPE: &str = "license-mirror";

/// A locally stored, integrity-stamped license activation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseRecord {
    /// The normalized license token.
    pub key: String,
    /// The payload decoded at activation.
    pub payload: LicensePayload,
    /// When the license was activated.
    pub activated_at: DateTime<Utc>,
    /// Latest time the license was seen valid; only moves forward.
    pub last_seen: DateTime<Utc>,
    /// Hex SHA-256 of the canonical payload JSON.
    pub stamp: String,
    /// HMAC of `stamp` under the record key.
    pub stamp_hmac: String,
}

impl LicenseRecord {
    /// Creates a record activated at `now` and stamps it with `keys`.
    pub fn new(
        key: impl Into<String>,
        payload: LicensePayload,
        now: DateTime<Utc>,
        keys: &mut KeyRing,
    ) -> LicenseResult<Self> {
        let mut record = Self {
            key: key.into(),
            payload,
            activated_at: now,
            last_seen: now,
            stamp: String::new(),
            stamp_hmac: String::new(),
        };
        record.restamp(keys)?;
        Ok(record)
    }

    /// Hash of the canonical payload JSON.
    pub fn payload_stamp(payload: &LicensePayload) -> LicenseResult<String> {
        Ok(sha256_hex(&serde_json::to_vec(payload)?))
    }

    /// Recomputes the stamp and its HMAC under `keys`.
    pub fn restamp(&mut self, keys: &mut KeyRing) -> LicenseResult<()> {
        self.stamp = Self::payload_stamp(&self.payload)?;
        self.stamp_hmac = hmac_hex(keys.mac_key()?.as_bytes(), self.stamp.as_bytes());
        Ok(())
    }

    /// Returns true if the stamp matches the payload and the HMAC verifies.
    pub fn verify_integrity(&self, keys: &mut KeyRing) -> LicenseResult<bool> {
        if Self::payload_stamp(&self.payload)? != self.stamp {
            return Ok(false);
        }
        let mac_key = keys.mac_key()?;
        Ok(verify_hmac_hex(
            mac_key.as_bytes(),
            self.stamp.as_bytes(),
            &self.stamp_hmac,
        ))
    }
}

/// Result of loading a record.
#[derive(Debug)]
pub enum RecordLoad {
    /// A record was opened.
    Found {
        /// The record.
        record: LicenseRecord,
        /// The envelope used a legacy format.
        needs_reseal: bool,
    },
    /// No record is stored.
    Missing,
    /// A record exists but cannot be read.
    Corrupt(String),
}

/// Per-user record file plus its machine-wide mirror.
#[derive(Debug, Clone)]
pub struct LicenseRecordStore {
    user_path: PathBuf,
    mirror_path: PathBuf,
}

impl LicenseRecordStore {
    /// Creates a store over the two record files.
    pub fn new(user_path: impl Into<PathBuf>, mirror_path: impl Into<PathBuf>) -> Self {
        Self {
            user_path: user_path.into(),
            mirror_path: mirror_path.into(),
        }
    }

    /// Loads the per-user record.
    pub fn load_user(&self, keys: &mut KeyRing, fingerprint_hash: &str) -> RecordLoad {
        load(&self.user_path, keys, &Aad::new(LICENSE_SCOPE, fingerprint_hash))
    }

    /// Loads the machine-wide mirror.
    pub fn load_mirror(&self, machine_keys: &mut KeyRing, fingerprint_hash: &str) -> RecordLoad {
        load(
            &self.mirror_path,
            machine_keys,
            &Aad::new(MIRROR_SCOPE, fingerprint_hash),
        )
    }

    /// Seals and writes the per-user record.
    pub fn save_user(
        &self,
        record: &LicenseRecord,
        keys: &mut KeyRing,
        fingerprint_hash: &str,
    ) -> LicenseResult<()> {
        save(
            &self.user_path,
            record,
            keys,
            &Aad::new(LICENSE_SCOPE, fingerprint_hash),
        )
    }

    /// Seals and writes the machine-wide mirror.
    pub fn save_mirror(
        &self,
        record: &LicenseRecord,
        machine_keys: &mut KeyRing,
        fingerprint_hash: &str,
    ) -> LicenseResult<()> {
        save(
            &self.mirror_path,
            record,
            machine_keys,
            &Aad::new(MIRROR_SCOPE, fingerprint_hash),
        )
    }

    /// Removes the record and its mirror.
    pub fn clear(&self) -> LicenseResult<()> {
        storage::remove(&self.user_path).map_err(|e| LicenseError::Storage(e.to_string()))?;
        storage::remove(&self.mirror_path).map_err(|e| LicenseError::Storage(e.to_string()))
    }
}

fn load(path: &Path, keys: &mut KeyRing, aad: &Aad) -> RecordLoad {
    let bytes = match storage::read(path) {
        ReadOutcome::Found(bytes) => bytes,
        ReadOutcome::Missing => return RecordLoad::Missing,
        ReadOutcome::Unavailable(e) => return RecordLoad::Corrupt(e.to_string()),
    };

    let opened = SealedEnvelope::from_bytes(&bytes)
        .map_err(LicenseError::from)
        .and_then(|envelope| keys.open::<LicenseRecord>(&envelope, aad));
    match opened {
        Ok(opened) => {
            debug!("Opened license record at {:?}", path);
            RecordLoad::Found {
                record: opened.value,
                needs_reseal: opened.needs_reseal,
            }
        }
        Err(e) => RecordLoad::Corrupt(e.to_string()),
    }
}

fn save(path: &Path, record: &LicenseRecord, keys: &mut KeyRing, aad: &Aad) -> LicenseResult<()> {
    let bytes = keys.seal(record, aad)?.to_bytes()?;
    storage::write_atomic(path, &bytes).map_err(|e| LicenseError::Storage(e.to_string()))
}
