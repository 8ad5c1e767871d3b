use entitle_license::{ConsumedLicenseLedger, StoragePaths};
use pretty_assertions::assert_eq;
use std::collections::BTreeSet;
use tempfile::tempdir;

#[test]
fn fresh_ledger_is_empty() {
    let dir = tempdir().unwrap();
    let ledger = ConsumedLicenseLedger::new(&StoragePaths::under(dir.path()));

    assert!(!ledger.is_consumed("L1"));
    assert!(ledger.consumed_ids().is_empty());
    assert_eq!(ledger.active_binding("L1"), None);
}

#[test]
fn consumed_ids_persist_across_instances() {
    let dir = tempdir().unwrap();
    let paths = StoragePaths::under(dir.path());
    ConsumedLicenseLedger::new(&paths).mark_consumed("L1").unwrap();
    ConsumedLicenseLedger::new(&paths).mark_consumed("L2").unwrap();

    let reopened = ConsumedLicenseLedger::new(&paths);
    assert!(reopened.is_consumed("L1"));
    assert!(reopened.is_consumed("L2"));
    assert!(!reopened.is_consumed("L3"));
    assert!(paths.consumed_file().exists());
    assert!(!paths.user_consumed_file().exists());
}

#[test]
fn marking_twice_is_idempotent() {
    let dir = tempdir().unwrap();
    let ledger = ConsumedLicenseLedger::new(&StoragePaths::under(dir.path()));
    ledger.mark_consumed("L1").unwrap();
    ledger.mark_consumed("L1").unwrap();

    assert_eq!(ledger.consumed_ids(), BTreeSet::from(["L1".to_string()]));
}

#[test]
fn unwritable_machine_dir_falls_back_to_user_copy() {
    let dir = tempdir().unwrap();
    let paths = StoragePaths::under(dir.path());
    std::fs::write(&paths.machine_dir, b"not a directory").unwrap();

    let ledger = ConsumedLicenseLedger::new(&paths);
    ledger.mark_consumed("L9").unwrap();

    assert!(paths.user_consumed_file().exists());
    assert!(ledger.is_consumed("L9"));
}

#[test]
fn reads_union_machine_and_user_copies() {
    let dir = tempdir().unwrap();
    let paths = StoragePaths::under(dir.path());
    std::fs::create_dir_all(&paths.user_dir).unwrap();
    std::fs::write(
        paths.user_consumed_file(),
        br#"{"license_ids":["from-user"],"active":{"from-user":"fp-user"}}"#,
    )
    .unwrap();

    let ledger = ConsumedLicenseLedger::new(&paths);
    ledger.mark_consumed("from-machine").unwrap();

    let ids = ledger.consumed_ids();
    assert!(ids.contains("from-user"));
    assert!(ids.contains("from-machine"));
    assert_eq!(ledger.active_binding("from-user").as_deref(), Some("fp-user"));
}

#[test]
fn unreadable_ledger_file_is_ignored() {
    let dir = tempdir().unwrap();
    let paths = StoragePaths::under(dir.path());
    std::fs::create_dir_all(&paths.machine_dir).unwrap();
    std::fs::write(paths.consumed_file(), b"{{{").unwrap();

    let ledger = ConsumedLicenseLedger::new(&paths);
    assert!(ledger.consumed_ids().is_empty());
    ledger.mark_consumed("L1").unwrap();
    assert!(ledger.is_consumed("L1"));
}

#[test]
fn first_active_binding_is_kept() {
    let dir = tempdir().unwrap();
    let ledger = ConsumedLicenseLedger::new(&StoragePaths::under(dir.path()));
    ledger.record_active("L1", "fp-a").unwrap();
    ledger.record_active("L1", "fp-b").unwrap();

    assert_eq!(ledger.active_binding("L1").as_deref(), Some("fp-a"));
    assert!(!ledger.is_consumed("L1"));
}
