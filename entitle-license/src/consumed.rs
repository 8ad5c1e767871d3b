//! Machine-wide record of spent licenses.
//!
//! Once a license id is consumed it can never be activated again on this
//! machine. The ledger also remembers which fingerprint each license was
//! activated under, so a license re-presented under a different machine
//! binding can be caught.
//!
//! The ledger lives in the machine directory so it survives profile wipes
//! and reinstalls. When that directory is not writable a per-user copy is
//! written instead; reads always take the union of both.

use crate::config::StoragePaths;
use crate::error::{LicenseError, LicenseResult};
use crate::storage::{self, ReadOutcome};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct LedgerFile {
    #[serde(default)]
    license_ids: BTreeSet<String>,
    #[serde(default)]
    active: BTreeMap<String, String>,
}

impl LedgerFile {
    fn merge(&mut self, other: LedgerFile) {
        self.license_ids.extend(other.license_ids);
        for (id, binding) in other.active {
            self.active.entry(id).or_insert(binding);
        }
    }
}

/// Append-only set of consumed license ids.
#[derive(Debug, Clone)]
pub struct ConsumedLicenseLedger {
    machine_path: PathBuf,
    user_path: PathBuf,
}

impl ConsumedLicenseLedger {
    /// Creates a ledger over the files in `paths`.
    pub fn new(paths: &StoragePaths) -> Self {
        Self {
            machine_path: paths.consumed_file(),
            user_path: paths.user_consumed_file(),
        }
    }

    /// Returns true if `license_id` has been consumed.
    pub fn is_consumed(&self, license_id: &str) -> bool {
        self.load().license_ids.contains(license_id)
    }

    /// Returns every consumed id.
    pub fn consumed_ids(&self) -> BTreeSet<String> {
        self.load().license_ids
    }

    /// Records `license_id` as consumed.
    pub fn mark_consumed(&self, license_id: &str) -> LicenseResult<()> {
        let mut ledger = self.load();
        if !ledger.license_ids.insert(license_id.to_string()) {
            return Ok(());
        }
        self.store(&ledger)?;
        info!("License {} marked consumed", license_id);
        Ok(())
    }

    /// Returns the fingerprint hash `license_id` was activated under.
    pub fn active_binding(&self, license_id: &str) -> Option<String> {
        self.load().active.get(license_id).cloned()
    }

    /// Records that `license_id` is active under `fingerprint_hash`.
    ///
    /// The first recorded binding is kept.
    pub fn record_active(&self, license_id: &str, fingerprint_hash: &str) -> LicenseResult<()> {
        let mut ledger = self.load();
        if ledger.active.contains_key(license_id) {
            return Ok(());
        }
        ledger
            .active
            .insert(license_id.to_string(), fingerprint_hash.to_string());
        self.store(&ledger)
    }

    fn load(&self) -> LedgerFile {
        let mut ledger = read_ledger(&self.machine_path);
        ledger.merge(read_ledger(&self.user_path));
        ledger
    }

    fn store(&self, ledger: &LedgerFile) -> LicenseResult<()> {
        let bytes = serde_json::to_vec_pretty(ledger)?;
        match storage::write_atomic(&self.machine_path, &bytes) {
            Ok(()) => {
                debug!("Consumed ledger written to {:?}", self.machine_path);
                Ok(())
            }
            Err(machine_err) => {
                warn!(
                    "Machine-wide ledger {:?} not writable ({}), using per-user copy",
                    self.machine_path, machine_err
                );
                storage::write_atomic(&self.user_path, &bytes).map_err(|e| {
                    LicenseError::Storage(format!(
                        "consumed ledger not writable: {machine_err}; {e}"
                    ))
                })
            }
        }
    }
}

fn read_ledger(path: &Path) -> LedgerFile {
    match storage::read(path) {
        ReadOutcome::Found(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            warn!("Consumed ledger {:?} unreadable: {}", path, e);
            LedgerFile::default()
        }),
        ReadOutcome::Missing => LedgerFile::default(),
        ReadOutcome::Unavailable(e) => {
            debug!("Consumed ledger {:?} inaccessible: {}", path, e);
            LedgerFile::default()
        }
    }
}
