//! Trial accounting.
//!
//! Elapsed time is counted in local calendar days from the trial start to
//! the latest day ever observed. Clock problems and stamp tampering are
//! reported as flags; only elapsed days expire a trial.

use crate::clock::{calendar_days_between, local_day, start_of_local_day};
use crate::error::{LicenseError, LicenseResult};
use crate::keys::KeyRing;
use crate::stamp::RedundantStampStore;
use crate::storage::{self, ReadOutcome};
use chrono::{DateTime, Utc};
use entitle_crypto::{Aad, SealedEnvelope};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info, warn};

const TRIAL_SCOPE: &str = "trial";

/// Locally sealed trial state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialState {
    /// When the trial started.
    pub trial_start: DateTime<Utc>,
    /// Latest time a status check ran; only moves forward.
    pub last_run: DateTime<Utc>,
}

/// Result of a trial status check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrialStatus {
    /// No trial days remain.
    pub expired: bool,
    /// Calendar days used.
    pub days_used: i64,
    /// Calendar days remaining, never negative.
    pub days_left: i64,
    /// Effective trial start.
    pub trial_start: DateTime<Utc>,
    /// The clock is behind previously recorded time.
    pub clock_issue: bool,
    /// A stamp copy was structurally altered.
    pub tamper: bool,
}

/// Tracks the trial for one user on one machine.
#[derive(Debug, Clone)]
pub struct TrialLedger {
    path: PathBuf,
    stamps: RedundantStampStore,
    trial_days: i64,
}

impl TrialLedger {
    /// Creates a ledger sealing its state at `path`.
    pub fn new(path: impl Into<PathBuf>, stamps: RedundantStampStore, trial_days: i64) -> Self {
        Self {
            path: path.into(),
            stamps,
            trial_days,
        }
    }

    /// Returns the stamp store.
    pub fn stamps(&self) -> &RedundantStampStore {
        &self.stamps
    }

    /// Checks the trial at `now`, advancing recorded time and repairing stamps.
    ///
    /// Never fails: unreadable state starts a fresh trial, and write failures
    /// are logged.
    pub fn status(
        &self,
        keys: &mut KeyRing,
        fingerprint_hash: &str,
        now: DateTime<Utc>,
    ) -> TrialStatus {
        let today = local_day(now);
        let aad = Aad::new(TRIAL_SCOPE, fingerprint_hash);
        let local = self.load(keys, &aad);

        let mut report = self.stamps.reconcile(fingerprint_hash, today);

        let trial_start = match (&local, report.first_day) {
            (Some(state), Some(first_day)) if first_day < local_day(state.trial_start) => {
                info!("Trial start moved back to stamped day {}", first_day);
                start_of_local_day(first_day)
            }
            (Some(state), _) => state.trial_start,
            (None, Some(first_day)) => {
                info!("Trial state missing, resuming from stamped day {}", first_day);
                start_of_local_day(first_day).min(now)
            }
            (None, None) => {
                info!("Starting trial");
                now
            }
        };

        let previous_run = local.as_ref().map(|s| s.last_run);
        let last_run = previous_run.map_or(now, |prev| prev.max(now));

        let mut high_day = today;
        if let Some(last_day) = report.last_day {
            high_day = high_day.max(last_day);
        }
        if let Some(prev) = previous_run {
            high_day = high_day.max(local_day(prev));
        }

        let clock_issue = previous_run.is_some_and(|prev| now < prev) || report.clock_rollback;
        if clock_issue {
            warn!("Clock is behind recorded time; counting days to {}", high_day);
        }
        let tamper = report.tamper;

        let start_day = local_day(trial_start);
        let days_used = calendar_days_between(start_day, high_day);
        let days_left = (self.trial_days - days_used).max(0);

        let state = TrialState {
            trial_start,
            last_run,
        };
        self.save(keys, &aad, &state);
        self.stamps
            .advance(&mut report, fingerprint_hash, start_day, high_day);

        debug!("Trial: {} days used, {} left", days_used, days_left);
        TrialStatus {
            expired: days_left <= 0,
            days_used,
            days_left,
            trial_start,
            clock_issue,
            tamper,
        }
    }

    /// Moves recorded time and the stamps forward to `now` while a license
    /// is in use, so days spent licensed still count if the trial applies
    /// again later. Starts the trial if none is recorded.
    pub fn touch(&self, keys: &mut KeyRing, fingerprint_hash: &str, now: DateTime<Utc>) {
        let status = self.status(keys, fingerprint_hash, now);
        debug!("Trial high-water advanced ({} days used)", status.days_used);
    }

    /// Deletes the trial state and every stamp.
    pub fn reset(&self) -> std::io::Result<()> {
        storage::remove(&self.path)?;
        self.stamps.clear()?;
        info!("Trial state reset");
        Ok(())
    }

    fn load(&self, keys: &mut KeyRing, aad: &Aad) -> Option<TrialState> {
        let bytes = match storage::read(&self.path) {
            ReadOutcome::Found(bytes) => bytes,
            ReadOutcome::Missing => return None,
            ReadOutcome::Unavailable(e) => {
                warn!("Trial state inaccessible ({}), starting fresh", e);
                return None;
            }
        };

        let opened = SealedEnvelope::from_bytes(&bytes)
            .map_err(LicenseError::from)
            .and_then(|envelope| keys.open::<TrialState>(&envelope, aad));
        match opened {
            Ok(opened) => {
                if opened.needs_reseal {
                    info!("Migrating legacy trial envelope");
                }
                Some(opened.value)
            }
            Err(e) => {
                warn!("Trial state unreadable ({}), starting fresh", e);
                None
            }
        }
    }

    fn save(&self, keys: &mut KeyRing, aad: &Aad, state: &TrialState) {
        if let Err(e) = self.try_save(keys, aad, state) {
            warn!("Failed to save trial state: {}", e);
        }
    }

    fn try_save(&self, keys: &mut KeyRing, aad: &Aad, state: &TrialState) -> LicenseResult<()> {
        let bytes = keys.seal(state, aad)?.to_bytes()?;
        storage::write_atomic(&self.path, &bytes).map_err(|e| LicenseError::Storage(e.to_string()))
    }
}
