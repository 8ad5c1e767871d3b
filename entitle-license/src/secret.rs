//! Per-user secret protected by the OS.
//!
//! The secret is a random 32-byte value wrapped at rest with the platform's
//! user-scoped data protection. Where that facility is missing or broken the
//! store falls back to a deterministic value derived from [`APP_PEPPER`]:
//! entitlement checks keep working, only tamper resistance is weaker.

use crate::error::{LicenseError, LicenseResult};
use crate::storage::{self, ReadOutcome};
use entitle_crypto::sha256;
use rand::RngCore;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Static application pepper. Seeds the fallback secret and stamp keys.
pub const APP_PEPPER: &[u8] = b"entitle.app-pepper.7c1e9f04a2d35b68";

/// Size of the per-user secret in bytes.
pub const SECRET_SIZE: usize = 32;

/// User-scoped protect/unprotect primitive.
pub trait SecureStorage: Send + Sync {
    /// Returns true when this machine can protect data.
    fn is_available(&self) -> bool;

    /// Wraps `plaintext` so only the current user can unwrap it.
    fn protect(&self, plaintext: &[u8]) -> LicenseResult<Vec<u8>>;

    /// Reverses [`protect`](Self::protect).
    fn unprotect(&self, protected: &[u8]) -> LicenseResult<Vec<u8>>;
}

/// Where a secret came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretSource {
    /// Unwrapped from (or freshly written to) OS-protected storage.
    Protected,
    /// Derived from the application pepper.
    Fallback,
}

/// The per-user secret that keys are derived from.
#[derive(Clone)]
pub struct Secret {
    bytes: [u8; SECRET_SIZE],
    source: SecretSource,
}

impl Secret {
    /// The deterministic fallback secret, `SHA-256(APP_PEPPER)`.
    #[must_use]
    pub fn fallback() -> Self {
        Self {
            bytes: sha256(APP_PEPPER),
            source: SecretSource::Fallback,
        }
    }

    /// Returns the secret bytes.
    pub fn as_bytes(&self) -> &[u8; SECRET_SIZE] {
        &self.bytes
    }

    /// Returns where the secret came from.
    pub fn source(&self) -> SecretSource {
        self.source
    }

    /// Returns true when the secret is the weaker fallback.
    pub fn is_degraded(&self) -> bool {
        self.source == SecretSource::Fallback
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secret")
            .field("bytes", &"[REDACTED]")
            .field("source", &self.source)
            .finish()
    }
}

/// Loads or creates the per-user secret.
pub struct SecretStore<'a> {
    path: PathBuf,
    storage: &'a dyn SecureStorage,
}

impl<'a> SecretStore<'a> {
    /// Creates a store keeping the wrapped secret at `path`.
    pub fn new(path: impl Into<PathBuf>, storage: &'a dyn SecureStorage) -> Self {
        Self {
            path: path.into(),
            storage,
        }
    }

    /// Returns the per-user secret. Never fails.
    ///
    /// A missing or unreadable secret file is replaced with a fresh random
    /// secret. If protection is unavailable, or the new secret cannot be
    /// stored, the fallback secret is returned.
    pub fn get_or_create_secret(&self) -> Secret {
        if !self.storage.is_available() {
            debug!("OS data protection unavailable, using fallback secret");
            return Secret::fallback();
        }

        match storage::read(&self.path) {
            ReadOutcome::Found(wrapped) => match self.unwrap(&wrapped) {
                Ok(secret) => return secret,
                Err(e) => warn!("Stored secret unreadable ({}), generating a new one", e),
            },
            ReadOutcome::Missing => debug!("No stored secret at {:?}", self.path),
            ReadOutcome::Unavailable(e) => {
                warn!("Secret file {:?} inaccessible: {}", self.path, e);
                return Secret::fallback();
            }
        }

        match self.create() {
            Ok(secret) => secret,
            Err(e) => {
                warn!("Could not store a protected secret: {}", e);
                Secret::fallback()
            }
        }
    }

    fn unwrap(&self, wrapped: &[u8]) -> LicenseResult<Secret> {
        let plain = self.storage.unprotect(wrapped)?;
        let bytes: [u8; SECRET_SIZE] = plain.as_slice().try_into().map_err(|_| {
            LicenseError::SecureStorage(format!("unwrapped secret has {} bytes", plain.len()))
        })?;
        Ok(Secret {
            bytes,
            source: SecretSource::Protected,
        })
    }

    fn create(&self) -> LicenseResult<Secret> {
        let mut bytes = [0u8; SECRET_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);

        let wrapped = self.storage.protect(&bytes)?;
        storage::write_atomic(&self.path, &wrapped)
            .map_err(|e| LicenseError::Storage(e.to_string()))?;
        info!("Created protected secret at {:?}", self.path);

        Ok(Secret {
            bytes,
            source: SecretSource::Protected,
        })
    }
}

/// The OS data-protection facility for the target platform.
///
/// - Windows: DPAPI, current-user scope
/// - macOS: a wrapping key kept in the login keychain
/// - elsewhere: unavailable
#[derive(Debug, Clone)]
pub struct OsSecureStorage {
    #[cfg_attr(not(target_os = "macos"), allow(dead_code))]
    service: String,
}

impl OsSecureStorage {
    /// Creates the platform storage for `app_name`.
    pub fn new(app_name: &str) -> Self {
        Self {
            service: format!("{app_name}.entitlement"),
        }
    }
}

#[cfg(target_os = "windows")]
impl SecureStorage for OsSecureStorage {
    fn is_available(&self) -> bool {
        true
    }

    fn protect(&self, plaintext: &[u8]) -> LicenseResult<Vec<u8>> {
        dpapi::protect(plaintext)
    }

    fn unprotect(&self, protected: &[u8]) -> LicenseResult<Vec<u8>> {
        dpapi::unprotect(protected)
    }
}

#[cfg(target_os = "macos")]
impl SecureStorage for OsSecureStorage {
    fn is_available(&self) -> bool {
        keychain::entry(&self.service).is_ok()
    }

    fn protect(&self, plaintext: &[u8]) -> LicenseResult<Vec<u8>> {
        let key = keychain::load_or_create_key(&self.service)?;
        let sealed = entitle_crypto::encrypt(&key, plaintext, keychain::AAD)?;
        Ok(sealed.to_bytes())
    }

    fn unprotect(&self, protected: &[u8]) -> LicenseResult<Vec<u8>> {
        let key = keychain::load_key(&self.service)?;
        let sealed = entitle_crypto::EncryptedData::from_bytes(protected)?;
        Ok(entitle_crypto::decrypt(&key, &sealed, keychain::AAD)?)
    }
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
impl SecureStorage for OsSecureStorage {
    fn is_available(&self) -> bool {
        false
    }

    fn protect(&self, _plaintext: &[u8]) -> LicenseResult<Vec<u8>> {
        Err(LicenseError::SecureStorage(
            "no OS data protection on this platform".to_string(),
        ))
    }

    fn unprotect(&self, _protected: &[u8]) -> LicenseResult<Vec<u8>> {
        Err(LicenseError::SecureStorage(
            "no OS data protection on this platform".to_string(),
        ))
    }
}

#[cfg(target_os = "windows")]
mod dpapi {
    use crate::error::{LicenseError, LicenseResult};
    use windows::Win32::Foundation::{HLOCAL, LocalFree};
    use windows::Win32::Security::Cryptography::{
        CRYPT_INTEGER_BLOB, CRYPTPROTECT_UI_FORBIDDEN, CryptProtectData, CryptUnprotectData,
    };

    pub fn protect(data: &[u8]) -> LicenseResult<Vec<u8>> {
        let input = CRYPT_INTEGER_BLOB {
            cbData: data.len() as u32,
            pbData: data.as_ptr() as *mut u8,
        };
        let mut output = CRYPT_INTEGER_BLOB::default();

        unsafe {
            CryptProtectData(
                &input,
                None,
                None,
                None,
                None,
                CRYPTPROTECT_UI_FORBIDDEN,
                &mut output,
            )
        }
        .map_err(|e| LicenseError::SecureStorage(format!("CryptProtectData failed: {e}")))?;

        Ok(take_blob(output))
    }

    pub fn unprotect(data: &[u8]) -> LicenseResult<Vec<u8>> {
        let input = CRYPT_INTEGER_BLOB {
            cbData: data.len() as u32,
            pbData: data.as_ptr() as *mut u8,
        };
        let mut output = CRYPT_INTEGER_BLOB::default();

        unsafe {
            CryptUnprotectData(
                &input,
                None,
                None,
                None,
                None,
                CRYPTPROTECT_UI_FORBIDDEN,
                &mut output,
            )
        }
        .map_err(|e| LicenseError::SecureStorage(format!("CryptUnprotectData failed: {e}")))?;

        Ok(take_blob(output))
    }

    /// Copies a DPAPI output blob and releases its `LocalAlloc` buffer.
    fn take_blob(blob: CRYPT_INTEGER_BLOB) -> Vec<u8> {
        if blob.pbData.is_null() {
            return Vec::new();
        }
        let bytes =
            unsafe { std::slice::from_raw_parts(blob.pbData, blob.cbData as usize) }.to_vec();
        unsafe {
            let _ = LocalFree(HLOCAL(blob.pbData.cast()));
        }
        bytes
    }
}

#[cfg(target_os = "macos")]
mod keychain {
    use crate::error::{LicenseError, LicenseResult};
    use entitle_crypto::{DerivedKey, KEY_SIZE, generate_random_key};

    const ACCOUNT: &str = "state-wrapping-key";
    pub const AAD: &[u8] = b"entitle/secret-wrap";

    pub fn entry(service: &str) -> LicenseResult<keyring::Entry> {
        keyring::Entry::new(service, ACCOUNT)
            .map_err(|e| LicenseError::SecureStorage(e.to_string()))
    }

    pub fn load_key(service: &str) -> LicenseResult<DerivedKey> {
        let encoded = entry(service)?
            .get_password()
            .map_err(|e| LicenseError::SecureStorage(e.to_string()))?;
        let bytes = hex::decode(encoded.trim())
            .map_err(|e| LicenseError::SecureStorage(e.to_string()))?;
        let bytes: [u8; KEY_SIZE] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| LicenseError::SecureStorage("wrapping key has wrong length".to_string()))?;
        Ok(DerivedKey::from_bytes(bytes))
    }

    pub fn load_or_create_key(service: &str) -> LicenseResult<DerivedKey> {
        match load_key(service) {
            Ok(key) => Ok(key),
            Err(_) => {
                let key = generate_random_key();
                entry(service)?
                    .set_password(&hex::encode(key.as_bytes()))
                    .map_err(|e| LicenseError::SecureStorage(e.to_string()))?;
                Ok(key)
            }
        }
    }
}
