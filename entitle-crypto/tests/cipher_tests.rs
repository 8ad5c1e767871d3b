use entitle_crypto::{EncryptedData, NONCE_SIZE, TAG_SIZE, decrypt, encrypt, generate_random_key};

#[test]
fn encrypt_decrypt_roundtrip() {
    let key = generate_random_key();
    let encrypted = encrypt(&key, b"Hello, World!", b"ctx").unwrap();
    let decrypted = decrypt(&key, &encrypted, b"ctx").unwrap();
    assert_eq!(decrypted, b"Hello, World!");
}

#[test]
fn encrypt_decrypt_empty() {
    let key = generate_random_key();
    let encrypted = encrypt(&key, b"", b"").unwrap();
    let decrypted = decrypt(&key, &encrypted, b"").unwrap();
    assert_eq!(decrypted, b"");
}

#[test]
fn wrong_key_fails_decryption() {
    let key1 = generate_random_key();
    let key2 = generate_random_key();
    let encrypted = encrypt(&key1, b"Secret", b"ctx").unwrap();
    assert!(decrypt(&key2, &encrypted, b"ctx").is_err());
}

#[test]
fn wrong_aad_fails_decryption() {
    let key = generate_random_key();
    let encrypted = encrypt(&key, b"Secret", b"trial").unwrap();
    assert!(decrypt(&key, &encrypted, b"license").is_err());
    assert!(decrypt(&key, &encrypted, b"").is_err());
}

#[test]
fn tampered_data_fails_decryption() {
    let key = generate_random_key();
    let mut encrypted = encrypt(&key, b"Secret", b"ctx").unwrap();
    encrypted.ciphertext[0] ^= 0xFF;
    assert!(decrypt(&key, &encrypted, b"ctx").is_err());
}

#[test]
fn same_plaintext_produces_different_ciphertext() {
    let key = generate_random_key();
    let e1 = encrypt(&key, b"Same", b"ctx").unwrap();
    let e2 = encrypt(&key, b"Same", b"ctx").unwrap();
    assert_ne!(e1.nonce, e2.nonce);
    assert_ne!(e1.ciphertext, e2.ciphertext);
}

// ── EncryptedData ────────────────────────────────────────────────

#[test]
fn encrypted_data_len_includes_nonce_and_tag() {
    let key = generate_random_key();
    let encrypted = encrypt(&key, b"test", b"").unwrap();
    assert_eq!(encrypted.ciphertext.len(), 4 + TAG_SIZE);
    assert_eq!(encrypted.len(), NONCE_SIZE + 4 + TAG_SIZE);
}

#[test]
fn encrypted_data_bytes_roundtrip() {
    let key = generate_random_key();
    let encrypted = encrypt(&key, b"wrapped secret", b"keychain").unwrap();
    let restored = EncryptedData::from_bytes(&encrypted.to_bytes()).unwrap();
    assert_eq!(restored, encrypted);
    assert_eq!(decrypt(&key, &restored, b"keychain").unwrap(), b"wrapped secret");
}

#[test]
fn encrypted_data_from_short_bytes_fails() {
    assert!(EncryptedData::from_bytes(&[0u8; NONCE_SIZE + TAG_SIZE - 1]).is_err());
}

#[test]
fn encrypted_data_is_empty() {
    let ed = EncryptedData {
        nonce: [0u8; NONCE_SIZE],
        ciphertext: vec![],
    };
    assert!(ed.is_empty());
}
