//! Redundant day stamps.
//!
//! A [`PlainStamp`] records the first and the latest calendar day the engine
//! has seen on this machine. Copies live in a machine-wide file, a per-user
//! file and a cross-check file in an unrelated per-user directory. Stamps are
//! authenticated with a key derived from the application pepper, not from the
//! per-user secret, so they remain verifiable after the secret is lost.
//!
//! Reconciliation favours availability:
//!
//! 1. A valid machine-wide copy is authoritative.
//! 2. Without one, the per-user copy (then the cross-check copy) is
//!    authoritative and gets promoted machine-wide.
//! 3. Copies that are missing, unreadable, or disagree are repaired to match.
//! 4. Only a copy whose MAC verifies but whose `fingerprint_hash` or
//!    `first_day` differs from the authority is reported as tamper. A
//!    `last_day` ahead of today is a clock rollback.
//!
//! Inaccessible locations are skipped, never treated as tamper.

use crate::config::StoragePaths;
use crate::secret::APP_PEPPER;
use crate::storage::{self, ReadOutcome};
use chrono::NaiveDate;
use entitle_crypto::{hmac_hex, verify_hmac_hex};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Stamp format version.
pub const STAMP_VERSION: u32 = 1;

/// A MAC-protected day stamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlainStamp {
    /// Format version.
    pub version: u32,
    /// Hash of the fingerprint of the machine that wrote the stamp.
    pub fingerprint_hash: String,
    /// First day the engine ran.
    pub first_day: NaiveDate,
    /// Latest day the engine has seen.
    pub last_day: NaiveDate,
    /// `HMAC-SHA256(stamp_key(fingerprint_hash), "first_day|last_day")`.
    pub mac: String,
}

impl PlainStamp {
    /// Creates a stamp and computes its MAC.
    pub fn new(fingerprint_hash: &str, first_day: NaiveDate, last_day: NaiveDate) -> Self {
        let mac = hmac_hex(
            &stamp_key(fingerprint_hash),
            mac_message(first_day, last_day).as_bytes(),
        );
        Self {
            version: STAMP_VERSION,
            fingerprint_hash: fingerprint_hash.to_string(),
            first_day,
            last_day,
            mac,
        }
    }

    /// Checks the version, the day ordering and the MAC.
    pub fn verify(&self) -> bool {
        self.version == STAMP_VERSION
            && self.first_day <= self.last_day
            && verify_hmac_hex(
                &stamp_key(&self.fingerprint_hash),
                mac_message(self.first_day, self.last_day).as_bytes(),
                &self.mac,
            )
    }
}

fn stamp_key(fingerprint_hash: &str) -> Vec<u8> {
    hmac_hex(APP_PEPPER, fingerprint_hash.as_bytes()).into_bytes()
}

fn mac_message(first_day: NaiveDate, last_day: NaiveDate) -> String {
    format!("{}|{}", first_day.format("%Y-%m-%d"), last_day.format("%Y-%m-%d"))
}

/// Where a stamp copy lives, in order of authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StampLocation {
    /// Machine-wide store.
    Machine,
    /// Per-user store.
    User,
    /// Per-user cross-check file.
    CrossCheck,
}

impl StampLocation {
    /// All locations, most authoritative first.
    pub const ALL: [StampLocation; 3] = [Self::Machine, Self::User, Self::CrossCheck];
}

/// The content of one stamp location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StampSlot {
    /// A stamp whose MAC verifies.
    Present(PlainStamp),
    /// No stamp file.
    Absent,
    /// A file that does not parse or whose MAC fails.
    Invalid,
    /// The location cannot be accessed.
    Unavailable,
}

/// Outcome of reconciling all stamp copies.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StampReport {
    /// Earliest first day among valid copies.
    pub first_day: Option<NaiveDate>,
    /// Latest last day among valid copies.
    pub last_day: Option<NaiveDate>,
    /// Which copy was authoritative.
    pub authority: Option<StampLocation>,
    /// A valid copy disagrees structurally with the authority.
    pub tamper: bool,
    /// Today is earlier than a recorded last day.
    pub clock_rollback: bool,
    /// The authority was written for a different fingerprint.
    pub foreign: bool,
    /// Locations rewritten by [`RedundantStampStore::advance`].
    pub repaired: Vec<StampLocation>,
    /// Locations that could not be read or written.
    pub unavailable: Vec<StampLocation>,
    slots: Vec<(StampLocation, StampSlot)>,
}

/// Reads, reconciles and writes the redundant stamp copies.
#[derive(Debug, Clone)]
pub struct RedundantStampStore {
    machine: PathBuf,
    user: PathBuf,
    crosscheck: PathBuf,
}

impl RedundantStampStore {
    /// Creates a store over the stamp files in `paths`.
    pub fn new(paths: &StoragePaths) -> Self {
        Self {
            machine: paths.machine_stamp_file(),
            user: paths.user_stamp_file(),
            crosscheck: paths.crosscheck_stamp_file(),
        }
    }

    /// Returns the file for `location`.
    pub fn path(&self, location: StampLocation) -> &PathBuf {
        match location {
            StampLocation::Machine => &self.machine,
            StampLocation::User => &self.user,
            StampLocation::CrossCheck => &self.crosscheck,
        }
    }

    /// Reads one location.
    pub fn read(&self, location: StampLocation) -> StampSlot {
        match storage::read(self.path(location)) {
            ReadOutcome::Found(bytes) => match serde_json::from_slice::<PlainStamp>(&bytes) {
                Ok(stamp) if stamp.verify() => StampSlot::Present(stamp),
                Ok(_) => {
                    debug!("Stamp at {:?} failed verification", location);
                    StampSlot::Invalid
                }
                Err(e) => {
                    debug!("Stamp at {:?} unparsable: {}", location, e);
                    StampSlot::Invalid
                }
            },
            ReadOutcome::Missing => StampSlot::Absent,
            ReadOutcome::Unavailable(e) => {
                debug!("Stamp at {:?} inaccessible: {}", location, e);
                StampSlot::Unavailable
            }
        }
    }

    /// Reads every location, most authoritative first.
    pub fn read_all(&self) -> Vec<(StampLocation, StampSlot)> {
        StampLocation::ALL
            .iter()
            .map(|&location| (location, self.read(location)))
            .collect()
    }

    /// Writes `stamp` to every location it can. Returns the locations that
    /// were written.
    pub fn write(&self, stamp: &PlainStamp) -> Vec<StampLocation> {
        StampLocation::ALL
            .iter()
            .copied()
            .filter(|&location| self.write_to(location, stamp))
            .collect()
    }

    fn write_to(&self, location: StampLocation, stamp: &PlainStamp) -> bool {
        let bytes = match serde_json::to_vec_pretty(stamp) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode stamp: {}", e);
                return false;
            }
        };
        match storage::write_atomic(self.path(location), &bytes) {
            Ok(()) => true,
            Err(e) => {
                debug!("Cannot write stamp at {:?}: {}", location, e);
                false
            }
        }
    }

    /// Reconciles all copies against `today` on the machine whose fingerprint
    /// hashes to `fingerprint_hash`.
    pub fn reconcile(&self, fingerprint_hash: &str, today: NaiveDate) -> StampReport {
        let slots = self.read_all();

        let present: Vec<(StampLocation, &PlainStamp)> = slots
            .iter()
            .filter_map(|(location, slot)| match slot {
                StampSlot::Present(stamp) => Some((*location, stamp)),
                _ => None,
            })
            .collect();

        let unavailable = slots
            .iter()
            .filter(|(_, slot)| *slot == StampSlot::Unavailable)
            .map(|(location, _)| *location)
            .collect();

        let Some(&(authority, auth)) = present.first() else {
            return StampReport {
                unavailable,
                slots,
                ..StampReport::default()
            };
        };

        let mut tamper = false;
        for (location, stamp) in present.iter().skip(1) {
            if stamp.fingerprint_hash != auth.fingerprint_hash || stamp.first_day != auth.first_day
            {
                warn!(
                    "Stamp at {:?} disagrees with authoritative {:?} copy",
                    location, authority
                );
                tamper = true;
            }
        }

        let first_day = present.iter().map(|(_, s)| s.first_day).min();
        let last_day = present.iter().map(|(_, s)| s.last_day).max();
        let clock_rollback = last_day.is_some_and(|last| today < last);
        if clock_rollback {
            warn!("Clock is behind the last recorded day {:?}", last_day);
        }

        let foreign = auth.fingerprint_hash != fingerprint_hash;
        if foreign {
            info!("Stamps were written under a different machine identity");
        }

        StampReport {
            first_day,
            last_day,
            authority: Some(authority),
            tamper,
            clock_rollback,
            foreign,
            repaired: Vec::new(),
            unavailable,
            slots,
        }
    }

    /// Writes the forward-only stamp `first_day..=max(last_day, report.last_day)`
    /// to every accessible location that does not already hold it.
    pub fn advance(
        &self,
        report: &mut StampReport,
        fingerprint_hash: &str,
        first_day: NaiveDate,
        last_day: NaiveDate,
    ) {
        let last_day = report.last_day.map_or(last_day, |recorded| recorded.max(last_day));
        let target = PlainStamp::new(fingerprint_hash, first_day, last_day.max(first_day));

        for (location, slot) in &report.slots {
            let repair = match slot {
                StampSlot::Unavailable => continue,
                StampSlot::Present(current) if *current == target => continue,
                StampSlot::Present(current) => {
                    current.fingerprint_hash != target.fingerprint_hash
                        || current.first_day != target.first_day
                }
                StampSlot::Absent | StampSlot::Invalid => true,
            };

            if !self.write_to(*location, &target) {
                if !report.unavailable.contains(location) {
                    report.unavailable.push(*location);
                }
                continue;
            }
            if repair {
                info!("Repaired stamp at {:?}", location);
                report.repaired.push(*location);
            }
        }

        report.first_day = Some(target.first_day);
        report.last_day = Some(target.last_day);
    }

    /// Removes every copy.
    pub fn clear(&self) -> std::io::Result<()> {
        for location in StampLocation::ALL {
            storage::remove(self.path(location))?;
        }
        Ok(())
    }
}
