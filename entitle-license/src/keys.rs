//! Derived-key cache for sealing state files.

use crate::error::LicenseResult;
use crate::secret::Secret;
use entitle_crypto::{
    Aad, DerivedKey, KdfParams, Opened, SALT_SIZE, Salt, SealedEnvelope, derive_key, open_any,
    seal, sha256,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;

const MAC_SALT_LABEL: &[u8] = b"entitle/record-mac";

/// Keys derived from one secret and one machine binding.
///
/// Derivation is deliberately slow, so each salt is derived at most once per
/// process. New envelopes are all sealed under a single per-process salt.
pub struct KeyRing {
    secret: Secret,
    binding: String,
    params: KdfParams,
    write_salt: Salt,
    cache: HashMap<Salt, DerivedKey>,
}

impl KeyRing {
    /// Creates a ring for `secret` bound to the machine `binding`.
    pub fn new(secret: Secret, binding: impl Into<String>, params: KdfParams) -> Self {
        Self {
            secret,
            binding: binding.into(),
            params,
            write_salt: Salt::random(),
            cache: HashMap::new(),
        }
    }

    /// Returns the secret this ring derives from.
    pub fn secret(&self) -> &Secret {
        &self.secret
    }

    /// Returns the key for `salt`, deriving it on first use.
    pub fn key_for(&mut self, salt: &Salt) -> LicenseResult<&DerivedKey> {
        if !self.cache.contains_key(salt) {
            let key = derive_key(self.secret.as_bytes(), &self.binding, salt, &self.params)?;
            self.cache.insert(*salt, key);
        }
        Ok(&self.cache[salt])
    }

    /// Key for record integrity stamps.
    pub fn mac_key(&mut self) -> LicenseResult<DerivedKey> {
        let digest = sha256(MAC_SALT_LABEL);
        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&digest[..SALT_SIZE]);
        self.key_for(&Salt::from_bytes(salt)).cloned()
    }

    /// Seals `value` under the per-process write salt.
    pub fn seal<T: Serialize>(&mut self, value: &T, aad: &Aad) -> LicenseResult<SealedEnvelope> {
        let salt = self.write_salt;
        let key = self.key_for(&salt)?;
        Ok(seal(value, key, &salt, aad)?)
    }

    /// Opens an envelope with the key for the salt it records.
    pub fn open<T: DeserializeOwned>(
        &mut self,
        envelope: &SealedEnvelope,
        aad: &Aad,
    ) -> LicenseResult<Opened<T>> {
        let salt = envelope.salt()?;
        let key = self.key_for(&salt)?;
        Ok(open_any(envelope, key, aad)?)
    }
}

impl std::fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRing")
            .field("secret", &self.secret)
            .field("cached_keys", &self.cache.len())
            .finish_non_exhaustive()
    }
}
