//! Cryptographic primitives for the Entitle engine.
//!
//! - [`key`]: Argon2id key derivation bound to a machine fingerprint
//! - [`cipher`]: ChaCha20-Poly1305 AEAD with associated data
//! - [`envelope`]: versioned sealed JSON envelopes
//! - [`mac`]: HMAC-SHA256 stamps and SHA-256 helpers

pub mod cipher;
pub mod envelope;
pub mod error;
pub mod key;
pub mod mac;

pub use cipher::{EncryptedData, NONCE_SIZE, TAG_SIZE, decrypt, encrypt};
pub use envelope::{
    Aad, ENVELOPE_VERSION, LEGACY_ENVELOPE_VERSION, Opened, SealedEnvelope, open, open_any, seal,
    seal_legacy,
};
pub use error::{CryptoError, CryptoResult};
pub use key::{DerivedKey, KEY_SIZE, KdfParams, SALT_SIZE, Salt, derive_key, generate_random_key};
pub use mac::{hmac_hex, sha256, sha256_hex, verify_hmac_hex};
