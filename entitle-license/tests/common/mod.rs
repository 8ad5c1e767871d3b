//! Shared test helpers for entitlement tests.

#![allow(dead_code)]

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use entitle_crypto::KdfParams;
use entitle_license::{
    EntitlementConfig, EntitlementContext, HardwareId, LicenseError, LicenseResult, ManualClock,
    PlatformIdentityProvider, SecureStorage, StoragePaths, compute_fingerprint,
};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

/// Returns a deterministic Ed25519 key pair from a fixed seed.
pub fn test_keypair() -> (SigningKey, VerifyingKey) {
    let seed: [u8; 32] = [
        1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24,
        25, 26, 27, 28, 29, 30, 31, 32,
    ];
    let signing_key = SigningKey::from_bytes(&seed);
    let verifying_key = signing_key.verifying_key();
    (signing_key, verifying_key)
}

/// A second key pair, for signatures the verifier must reject.
pub fn other_keypair() -> (SigningKey, VerifyingKey) {
    let signing_key = SigningKey::from_bytes(&[7u8; 32]);
    let verifying_key = signing_key.verifying_key();
    (signing_key, verifying_key)
}

/// Creates `base64url(payload_json).base64url(signature)`, signing the raw
/// payload bytes.
pub fn sign_token(signing_key: &SigningKey, payload_json: &str) -> String {
    let signature = signing_key.sign(payload_json.as_bytes());
    format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(payload_json.as_bytes()),
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    )
}

/// A complete payload bound to `fingerprint`.
pub fn payload_json(
    fingerprint: &str,
    license_id: &str,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> String {
    json!({
        "fingerprint": fingerprint,
        "issued_at": issued_at.to_rfc3339(),
        "expires_at": expires_at.to_rfc3339(),
        "license_id": license_id,
        "customer_id": "cust-1",
        "edition": "pro",
        "license_version": 2,
    })
    .to_string()
}

/// A signed token for `machine`.
pub fn make_token(
    signing_key: &SigningKey,
    machine: &str,
    license_id: &str,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> String {
    sign_token(
        signing_key,
        &payload_json(&fingerprint_for(machine), license_id, issued_at, expires_at),
    )
}

/// Identity provider returning fixed identifiers.
#[derive(Debug, Clone)]
pub struct FixedIdentityProvider(pub Vec<HardwareId>);

impl PlatformIdentityProvider for FixedIdentityProvider {
    fn identifiers(&self) -> Vec<HardwareId> {
        self.0.clone()
    }
}

/// Identifiers for the named test machine.
pub fn machine_ids(machine: &str) -> Vec<HardwareId> {
    vec![
        HardwareId::new("machine_id", format!("{machine}-guid")),
        HardwareId::new("volume_uuid", format!("{machine}-volume")),
    ]
}

/// Provider for the named test machine.
pub fn identity_for(machine: &str) -> Box<dyn PlatformIdentityProvider> {
    Box::new(FixedIdentityProvider(machine_ids(machine)))
}

/// Fingerprint of the named test machine.
pub fn fingerprint_for(machine: &str) -> String {
    compute_fingerprint(&machine_ids(machine)).unwrap()
}

/// Reversible stand-in for OS data protection.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemorySecureStorage;

const MEMORY_PREFIX: &[u8] = b"MEMP";

impl SecureStorage for MemorySecureStorage {
    fn is_available(&self) -> bool {
        true
    }

    fn protect(&self, plaintext: &[u8]) -> LicenseResult<Vec<u8>> {
        let mut out = MEMORY_PREFIX.to_vec();
        out.extend(plaintext.iter().map(|b| b ^ 0x5a));
        Ok(out)
    }

    fn unprotect(&self, protected: &[u8]) -> LicenseResult<Vec<u8>> {
        let body = protected
            .strip_prefix(MEMORY_PREFIX)
            .ok_or_else(|| LicenseError::SecureStorage("not protected by this user".into()))?;
        Ok(body.iter().map(|b| b ^ 0x5a).collect())
    }
}

/// Storage that reports OS protection as missing.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableSecureStorage;

impl SecureStorage for UnavailableSecureStorage {
    fn is_available(&self) -> bool {
        false
    }

    fn protect(&self, _plaintext: &[u8]) -> LicenseResult<Vec<u8>> {
        Err(LicenseError::SecureStorage("unavailable".into()))
    }

    fn unprotect(&self, _protected: &[u8]) -> LicenseResult<Vec<u8>> {
        Err(LicenseError::SecureStorage("unavailable".into()))
    }
}

/// Temp-dir storage, a manual clock and a signing key.
pub struct Harness {
    pub dir: TempDir,
    pub clock: ManualClock,
    pub signing_key: SigningKey,
}

impl Harness {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            clock: ManualClock::new(start),
            signing_key: test_keypair().0,
        }
    }

    pub fn paths(&self) -> StoragePaths {
        StoragePaths::under(self.dir.path())
    }

    pub fn config(&self) -> EntitlementConfig {
        EntitlementConfig {
            app_name: "EntitleTest".to_string(),
            kdf: KdfParams::fast(),
            paths: Some(self.paths()),
            allow_support_tools: true,
            ..EntitlementConfig::default()
        }
    }

    pub fn context(&self, machine: &str) -> EntitlementContext {
        self.context_with(self.config(), identity_for(machine))
    }

    pub fn context_with(
        &self,
        config: EntitlementConfig,
        provider: Box<dyn PlatformIdentityProvider>,
    ) -> EntitlementContext {
        EntitlementContext::builder(config)
            .identity_provider(provider)
            .secure_storage(Box::new(MemorySecureStorage))
            .clock(Arc::new(self.clock.clone()))
            .verifying_key(test_keypair().1)
            .build()
            .unwrap()
    }

    pub fn token(
        &self,
        machine: &str,
        license_id: &str,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> String {
        make_token(&self.signing_key, machine, license_id, issued_at, expires_at)
    }
}
