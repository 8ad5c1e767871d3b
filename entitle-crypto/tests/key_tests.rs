use entitle_crypto::{DerivedKey, KdfParams, SALT_SIZE, Salt, derive_key, generate_random_key};

const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";
const FINGERPRINT: &str = "4f2c1a0e9b7d";

fn salt() -> Salt {
    Salt::from_bytes([1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16])
}

// ── derive_key ───────────────────────────────────────────────────

#[test]
fn derive_key_is_deterministic() {
    let params = KdfParams::fast();
    let key1 = derive_key(SECRET, FINGERPRINT, &salt(), &params).unwrap();
    let key2 = derive_key(SECRET, FINGERPRINT, &salt(), &params).unwrap();
    assert_eq!(key1.as_bytes(), key2.as_bytes());
}

#[test]
fn different_fingerprints_produce_different_keys() {
    let params = KdfParams::fast();
    let key1 = derive_key(SECRET, "machine-a", &salt(), &params).unwrap();
    let key2 = derive_key(SECRET, "machine-b", &salt(), &params).unwrap();
    assert_ne!(key1.as_bytes(), key2.as_bytes());
}

#[test]
fn different_secrets_produce_different_keys() {
    let params = KdfParams::fast();
    let key1 = derive_key(b"secret-one", FINGERPRINT, &salt(), &params).unwrap();
    let key2 = derive_key(b"secret-two", FINGERPRINT, &salt(), &params).unwrap();
    assert_ne!(key1.as_bytes(), key2.as_bytes());
}

#[test]
fn secret_and_fingerprint_boundary_is_unambiguous() {
    let params = KdfParams::fast();
    let key1 = derive_key(b"ab", "c", &salt(), &params).unwrap();
    let key2 = derive_key(b"a", "bc", &salt(), &params).unwrap();
    assert_ne!(key1.as_bytes(), key2.as_bytes());
}

#[test]
fn different_salts_produce_different_keys() {
    let params = KdfParams::fast();
    let salt2 = Salt::from_bytes([16, 15, 14, 13, 12, 11, 10, 9, 8, 7, 6, 5, 4, 3, 2, 1]);
    let key1 = derive_key(SECRET, FINGERPRINT, &salt(), &params).unwrap();
    let key2 = derive_key(SECRET, FINGERPRINT, &salt2, &params).unwrap();
    assert_ne!(key1.as_bytes(), key2.as_bytes());
}

#[test]
fn invalid_params_are_reported() {
    let params = KdfParams {
        memory_cost: 1,
        time_cost: 0,
        parallelism: 1,
    };
    assert!(derive_key(SECRET, FINGERPRINT, &salt(), &params).is_err());
}

#[test]
fn default_params_are_memory_hard() {
    let params = KdfParams::default();
    assert_eq!(params.memory_cost, 16 * 1024);
    assert!(params.time_cost >= 2);
}

// ── Salt ─────────────────────────────────────────────────────────

#[test]
fn random_salts_differ() {
    assert_ne!(Salt::random(), Salt::random());
}

#[test]
fn salt_from_slice_checks_length() {
    assert!(Salt::from_slice(&[0u8; SALT_SIZE]).is_ok());
    assert!(Salt::from_slice(&[0u8; 8]).is_err());
}

// ── DerivedKey ───────────────────────────────────────────────────

#[test]
fn generate_random_key_produces_unique_keys() {
    let key1 = generate_random_key();
    let key2 = generate_random_key();
    assert_ne!(key1.as_bytes(), key2.as_bytes());
}

#[test]
fn derived_key_from_bytes_roundtrip() {
    let bytes = [42u8; 32];
    let key = DerivedKey::from_bytes(bytes);
    assert_eq!(*key.as_bytes(), bytes);
}

#[test]
fn key_debug_does_not_leak_bytes() {
    let key = generate_random_key();
    let debug = format!("{:?}", key);
    assert!(debug.contains("REDACTED"));
    assert!(!debug.contains(&format!("{:?}", key.as_bytes())));
}
