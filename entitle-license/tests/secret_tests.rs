mod common;

use common::{MemorySecureStorage, UnavailableSecureStorage};
use entitle_crypto::sha256;
use entitle_license::{APP_PEPPER, OsSecureStorage, Secret, SecretSource, SecretStore, SecureStorage};
use tempfile::tempdir;

#[test]
fn fallback_is_derived_from_pepper() {
    let secret = Secret::fallback();
    assert_eq!(secret.as_bytes(), &sha256(APP_PEPPER));
    assert_eq!(secret.source(), SecretSource::Fallback);
    assert!(secret.is_degraded());
}

#[test]
fn debug_output_is_redacted() {
    let rendered = format!("{:?}", Secret::fallback());
    assert!(rendered.contains("REDACTED"));
    assert!(!rendered.contains(&format!("{:?}", sha256(APP_PEPPER)[0..4].to_vec())));
}

#[test]
fn unavailable_storage_uses_fallback() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("secret.bin");
    let secret = SecretStore::new(&path, &UnavailableSecureStorage).get_or_create_secret();

    assert!(secret.is_degraded());
    assert_eq!(secret.as_bytes(), Secret::fallback().as_bytes());
    assert!(!path.exists());
}

#[test]
fn protected_secret_is_created_once() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("user").join("secret.bin");
    let storage = MemorySecureStorage;

    let first = SecretStore::new(&path, &storage).get_or_create_secret();
    assert_eq!(first.source(), SecretSource::Protected);
    assert_ne!(first.as_bytes(), Secret::fallback().as_bytes());
    assert!(path.exists());

    let second = SecretStore::new(&path, &storage).get_or_create_secret();
    assert_eq!(first.as_bytes(), second.as_bytes());
}

#[test]
fn secret_is_stored_wrapped() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("secret.bin");
    let secret = SecretStore::new(&path, &MemorySecureStorage).get_or_create_secret();

    let on_disk = std::fs::read(&path).unwrap();
    assert_ne!(on_disk.as_slice(), secret.as_bytes().as_slice());
    assert_eq!(
        MemorySecureStorage.unprotect(&on_disk).unwrap(),
        secret.as_bytes().to_vec()
    );
}

#[test]
fn unreadable_secret_is_replaced() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("secret.bin");
    std::fs::write(&path, b"written by another user").unwrap();

    let secret = SecretStore::new(&path, &MemorySecureStorage).get_or_create_secret();
    assert_eq!(secret.source(), SecretSource::Protected);

    let again = SecretStore::new(&path, &MemorySecureStorage).get_or_create_secret();
    assert_eq!(secret.as_bytes(), again.as_bytes());
}

#[test]
fn wrong_length_secret_is_replaced() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("secret.bin");
    std::fs::write(&path, MemorySecureStorage.protect(&[1, 2, 3]).unwrap()).unwrap();

    let secret = SecretStore::new(&path, &MemorySecureStorage).get_or_create_secret();
    assert_eq!(secret.source(), SecretSource::Protected);
    assert_ne!(secret.as_bytes()[..3], [1, 2, 3]);
}

#[test]
fn inaccessible_secret_file_uses_fallback() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("secret.bin");
    std::fs::create_dir_all(&path).unwrap();

    let secret = SecretStore::new(&path, &MemorySecureStorage).get_or_create_secret();
    assert!(secret.is_degraded());
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
#[test]
fn os_storage_is_unavailable_on_this_platform() {
    let storage = OsSecureStorage::new("EntitleTest");
    assert!(!storage.is_available());
    assert!(storage.protect(b"data").is_err());
}

#[cfg(any(target_os = "windows", target_os = "macos"))]
#[test]
fn os_storage_constructs() {
    let _ = OsSecureStorage::new("EntitleTest");
}
