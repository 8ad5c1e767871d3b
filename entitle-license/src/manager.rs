//! The entitlement entry point.
//!
//! [`EntitlementContext`] combines the license path and the trial path into
//! one status decision:
//!
//! ```text
//! Unlicensed ──activate──▶ Valid ──time──▶ Expired
//!      │                     │
//!      └── trial status ◀── Invalid (tamper_hmac, clock_rollback, ...)
//! ```
//!
//! There is one context per process. Its methods take `&mut self` and do
//! short blocking file I/O; async hosts call them from a blocking task.

use crate::activation::{LicenseRecord, LicenseRecordStore, RecordLoad};
use crate::clock::{Clock, SystemClock, calendar_days_between, local_day};
use crate::config::{EntitlementConfig, StoragePaths};
use crate::consumed::ConsumedLicenseLedger;
use crate::device::{DeviceInfo, MachineIdentity, NativeIdentityProvider, PlatformIdentityProvider};
use crate::error::{LicenseResult, RejectReason};
use crate::key::{LicensePayload, LicenseTokenVerifier, normalize};
use crate::keys::KeyRing;
use crate::rate_limit::TokenBucket;
use crate::secret::{OsSecureStorage, Secret, SecretSource, SecretStore, SecureStorage};
use crate::stamp::RedundantStampStore;
use crate::trial::{TrialLedger, TrialStatus};
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::VerifyingKey;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// How often the degraded-secret warning may repeat.
const DEGRADED_WARNING_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60 * 60);

/// License part of the status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LicenseState {
    /// No license is stored.
    Unlicensed,
    /// A license is stored and valid.
    Valid,
    /// The stored license has expired.
    Expired,
    /// A license is stored but cannot be trusted.
    Invalid,
}

/// Summary of the active license.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LicenseSummary {
    /// License identifier.
    pub license_id: String,
    /// Customer reference.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    /// Product edition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edition: Option<String>,
    /// Expiry time.
    pub expires_at: DateTime<Utc>,
}

impl From<&LicensePayload> for LicenseSummary {
    fn from(payload: &LicensePayload) -> Self {
        Self {
            license_id: payload.license_id.clone(),
            customer_id: payload.customer_id.clone(),
            edition: payload.edition.clone(),
            expires_at: payload.expires_at,
        }
    }
}

/// The entitlement decision handed to the UI layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntitlementStatus {
    /// A valid license is active.
    pub activated: bool,
    /// Neither a valid license nor trial days remain.
    pub expired: bool,
    /// Days left on the license or the trial.
    pub days_left: i64,
    /// Trial days used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days_used: Option<i64>,
    /// Trial start.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trial_start: Option<DateTime<Utc>>,
    /// The clock is behind recorded time.
    pub clock_issue: bool,
    /// Stored state was altered.
    pub tamper: bool,
    /// License part of the decision.
    pub license_state: LicenseState,
    /// Why the stored license was not accepted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
    /// The active or expired license.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license: Option<LicenseSummary>,
}

impl EntitlementStatus {
    fn trial(
        trial: TrialStatus,
        license_state: LicenseState,
        reason: Option<RejectReason>,
    ) -> Self {
        Self {
            activated: false,
            expired: trial.expired,
            days_left: trial.days_left,
            days_used: Some(trial.days_used),
            trial_start: Some(trial.trial_start),
            clock_issue: trial.clock_issue || reason == Some(RejectReason::ClockRollback),
            tamper: trial.tamper || reason == Some(RejectReason::TamperHmac),
            license_state,
            reason,
            license: None,
        }
    }
}

/// Result of an activation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivationResult {
    /// The license was activated.
    pub success: bool,
    /// The activated payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<LicensePayload>,
    /// Why activation was refused.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RejectReason>,
}

impl ActivationResult {
    fn accepted(payload: LicensePayload) -> Self {
        Self {
            success: true,
            payload: Some(payload),
            error: None,
        }
    }

    fn rejected(reason: RejectReason) -> Self {
        Self {
            success: false,
            payload: None,
            error: Some(reason),
        }
    }
}

enum LicenseEvaluation {
    None,
    Valid(LicensePayload),
    Expired(LicensePayload),
    Invalid(RejectReason),
}

enum MirrorRestore {
    Restored(LicenseRecord),
    /// No mirror, or its token no longer verifies.
    Absent,
    /// A mirror exists but does not open under this machine's keys.
    Unreadable,
}

/// Builds an [`EntitlementContext`] with injectable platform services.
pub struct EntitlementContextBuilder {
    config: EntitlementConfig,
    identity_provider: Option<Box<dyn PlatformIdentityProvider>>,
    secure_storage: Option<Box<dyn SecureStorage>>,
    clock: Option<Arc<dyn Clock>>,
    verifying_key: Option<VerifyingKey>,
}

impl EntitlementContextBuilder {
    /// Overrides the machine identity source.
    #[must_use]
    pub fn identity_provider(mut self, provider: Box<dyn PlatformIdentityProvider>) -> Self {
        self.identity_provider = Some(provider);
        self
    }

    /// Overrides the OS data-protection facility.
    #[must_use]
    pub fn secure_storage(mut self, storage: Box<dyn SecureStorage>) -> Self {
        self.secure_storage = Some(storage);
        self
    }

    /// Overrides the clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Uses `key` instead of resolving the configured public key.
    #[must_use]
    pub fn verifying_key(mut self, key: VerifyingKey) -> Self {
        self.verifying_key = Some(key);
        self
    }

    /// Builds the context.
    ///
    /// Fails only when a configured public key cannot be decoded.
    pub fn build(self) -> LicenseResult<EntitlementContext> {
        let config = self.config;
        let verifying_key = match self.verifying_key {
            Some(key) => key,
            None => config.public_key.resolve()?,
        };
        let verifier = LicenseTokenVerifier::new(verifying_key).with_limits(
            config.max_payload_segment,
            Duration::hours(config.not_before_grace_hours),
        );

        let paths = config.storage_paths();
        let identity = MachineIdentity::new(
            self.identity_provider
                .unwrap_or_else(|| Box::new(NativeIdentityProvider)),
        );
        let secure_storage = self
            .secure_storage
            .unwrap_or_else(|| Box::new(OsSecureStorage::new(&config.app_name)));

        let secret = SecretStore::new(paths.secret_file(), secure_storage.as_ref())
            .get_or_create_secret();
        let secret_source = secret.source();
        let binding = identity.binding().to_string();
        let user_keys = KeyRing::new(secret, binding.clone(), config.kdf.clone());
        let machine_keys = KeyRing::new(Secret::fallback(), binding, config.kdf.clone());

        let trial = TrialLedger::new(
            paths.trial_file(),
            RedundantStampStore::new(&paths),
            config.trial_days,
        );

        info!(
            "Entitlement context ready (secret: {:?}, fingerprint available: {})",
            secret_source,
            identity.fingerprint().is_some()
        );

        Ok(EntitlementContext {
            records: LicenseRecordStore::new(paths.license_file(), paths.license_mirror_file()),
            consumed: ConsumedLicenseLedger::new(&paths),
            limiter: TokenBucket::from_config(&config.rate_limit),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            config,
            paths,
            identity,
            verifier,
            user_keys,
            machine_keys,
            secret_source,
            trial,
            last_degraded_warning: None,
        })
    }
}

/// Process-wide entitlement state and operations.
pub struct EntitlementContext {
    config: EntitlementConfig,
    paths: StoragePaths,
    identity: MachineIdentity,
    clock: Arc<dyn Clock>,
    verifier: LicenseTokenVerifier,
    user_keys: KeyRing,
    machine_keys: KeyRing,
    secret_source: SecretSource,
    trial: TrialLedger,
    records: LicenseRecordStore,
    consumed: ConsumedLicenseLedger,
    limiter: TokenBucket,
    /// Last time the degraded-secret warning was logged; cleared on restart.
    last_degraded_warning: Option<Instant>,
}

impl EntitlementContext {
    /// Starts building a context from `config`.
    pub fn builder(config: EntitlementConfig) -> EntitlementContextBuilder {
        EntitlementContextBuilder {
            config,
            identity_provider: None,
            secure_storage: None,
            clock: None,
            verifying_key: None,
        }
    }

    /// Builds a context with native platform services.
    pub fn new(config: EntitlementConfig) -> LicenseResult<Self> {
        Self::builder(config).build()
    }

    /// Returns the configuration.
    pub fn config(&self) -> &EntitlementConfig {
        &self.config
    }

    /// Returns the storage locations in use.
    pub fn paths(&self) -> &StoragePaths {
        &self.paths
    }

    /// Returns where the per-user secret came from.
    pub fn secret_source(&self) -> SecretSource {
        self.secret_source
    }

    /// Returns the consumed-license ledger.
    pub fn consumed_ledger(&self) -> &ConsumedLicenseLedger {
        &self.consumed
    }

    /// Returns the machine fingerprint, if one can be derived.
    pub fn get_hardware_id(&self) -> Option<String> {
        self.identity.fingerprint().map(str::to_string)
    }

    /// Collects device details for support requests.
    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo::collect()
    }

    /// Computes the current entitlement. Never fails.
    pub fn get_status(&mut self) -> EntitlementStatus {
        self.warn_if_degraded();
        let now = self.clock.now();
        let fingerprint_hash = self.identity.fingerprint_hash();

        let evaluation = self.evaluate_license(&fingerprint_hash, now);
        if matches!(
            evaluation,
            LicenseEvaluation::Valid(_) | LicenseEvaluation::Expired(_)
        ) {
            self.trial.touch(&mut self.user_keys, &fingerprint_hash, now);
        }

        match evaluation {
            LicenseEvaluation::Valid(payload) => EntitlementStatus {
                activated: true,
                expired: false,
                days_left: calendar_days_between(local_day(now), local_day(payload.expires_at)),
                days_used: None,
                trial_start: None,
                clock_issue: false,
                tamper: false,
                license_state: LicenseState::Valid,
                reason: None,
                license: Some(LicenseSummary::from(&payload)),
            },
            LicenseEvaluation::Expired(payload) => EntitlementStatus {
                activated: false,
                expired: true,
                days_left: 0,
                days_used: None,
                trial_start: None,
                clock_issue: false,
                tamper: false,
                license_state: LicenseState::Expired,
                reason: Some(RejectReason::Expired),
                license: Some(LicenseSummary::from(&payload)),
            },
            LicenseEvaluation::Invalid(reason) => {
                let trial = self.trial.status(&mut self.user_keys, &fingerprint_hash, now);
                EntitlementStatus::trial(trial, LicenseState::Invalid, Some(reason))
            }
            LicenseEvaluation::None => {
                let trial = self.trial.status(&mut self.user_keys, &fingerprint_hash, now);
                EntitlementStatus::trial(trial, LicenseState::Unlicensed, None)
            }
        }
    }

    /// Activates `token` on this machine.
    pub fn activate(&mut self, token: &str) -> ActivationResult {
        let now = self.clock.now();
        if !self.limiter.try_acquire(now) {
            warn!("Activation attempt rate limited");
            return ActivationResult::rejected(RejectReason::RateLimited);
        }

        let payload = match self.verifier.decode(token) {
            Ok(payload) => payload,
            Err(reason) => {
                info!("Activation rejected: {}", reason.code());
                return ActivationResult::rejected(reason);
            }
        };
        let license_id = payload.license_id.clone();

        if self.consumed.is_consumed(&license_id) {
            info!("Activation rejected: license {} already consumed", license_id);
            return ActivationResult::rejected(RejectReason::LicenseConsumed);
        }

        if let Err(reason) = self
            .verifier
            .check_binding(&payload, self.identity.fingerprint(), now)
        {
            info!("Activation rejected: {}", reason.code());
            return ActivationResult::rejected(reason);
        }

        let fingerprint_hash = self.identity.fingerprint_hash();
        if let Some(bound) = self.consumed.active_binding(&license_id) {
            if bound != fingerprint_hash {
                warn!(
                    "License {} was activated under another machine binding",
                    license_id
                );
                if let Err(e) = self.consumed.mark_consumed(&license_id) {
                    warn!("Failed to record consumed license: {}", e);
                }
                return ActivationResult::rejected(RejectReason::LicenseConsumed);
            }
        }

        let record =
            match LicenseRecord::new(normalize(token), payload.clone(), now, &mut self.user_keys) {
                Ok(record) => record,
                Err(e) => {
                    warn!("Failed to stamp license record: {}", e);
                    return ActivationResult::rejected(RejectReason::StorageFailed);
                }
            };

        if let Err(e) = self
            .records
            .save_user(&record, &mut self.user_keys, &fingerprint_hash)
        {
            warn!("Failed to save license record: {}", e);
            return ActivationResult::rejected(RejectReason::StorageFailed);
        }
        self.save_mirror(&record, &fingerprint_hash);
        if let Err(e) = self.consumed.record_active(&license_id, &fingerprint_hash) {
            warn!("Failed to record active license: {}", e);
        }

        info!("License {} activated", license_id);
        ActivationResult::accepted(payload)
    }

    /// Deletes the trial state and all stamps.
    #[cfg(any(debug_assertions, feature = "support-tools"))]
    pub fn reset_trial(&mut self) -> LicenseResult<()> {
        self.require_support_tools()?;
        self.trial
            .reset()
            .map_err(|e| crate::LicenseError::Storage(e.to_string()))
    }

    /// Removes the stored license and its mirror. The consumed ledger is kept.
    #[cfg(any(debug_assertions, feature = "support-tools"))]
    pub fn deactivate(&mut self) -> LicenseResult<()> {
        self.require_support_tools()?;
        self.records.clear()?;
        info!("License deactivated");
        Ok(())
    }

    #[cfg(any(debug_assertions, feature = "support-tools"))]
    fn require_support_tools(&self) -> LicenseResult<()> {
        if self.config.allow_support_tools {
            Ok(())
        } else {
            Err(crate::LicenseError::SupportToolsDisabled)
        }
    }

    fn evaluate_license(
        &mut self,
        fingerprint_hash: &str,
        now: DateTime<Utc>,
    ) -> LicenseEvaluation {
        let loaded = self.records.load_user(&mut self.user_keys, fingerprint_hash);
        let (mut record, dirty) = match loaded {
            RecordLoad::Found {
                record,
                needs_reseal,
            } => (record, needs_reseal),
            RecordLoad::Missing => match self.restore_from_mirror(fingerprint_hash, now) {
                MirrorRestore::Restored(record) => (record, false),
                MirrorRestore::Absent | MirrorRestore::Unreadable => {
                    return LicenseEvaluation::None;
                }
            },
            RecordLoad::Corrupt(e) => {
                warn!("Stored license unreadable ({}), trying machine mirror", e);
                match self.restore_from_mirror(fingerprint_hash, now) {
                    MirrorRestore::Restored(record) => (record, false),
                    MirrorRestore::Absent => return LicenseEvaluation::None,
                    MirrorRestore::Unreadable => {
                        warn!("No license copy opens under this machine's fingerprint");
                        let reason = if self.identity.fingerprint().is_some() {
                            RejectReason::FingerprintMismatch
                        } else {
                            RejectReason::FingerprintUnavailable
                        };
                        return LicenseEvaluation::Invalid(reason);
                    }
                }
            }
        };

        match record.verify_integrity(&mut self.user_keys) {
            Ok(true) => {}
            Ok(false) => {
                warn!("License record failed its integrity check");
                return LicenseEvaluation::Invalid(RejectReason::TamperHmac);
            }
            Err(e) => {
                warn!("Cannot check license integrity: {}", e);
                return LicenseEvaluation::None;
            }
        }

        // Expiry is final even if the clock later reads an earlier time.
        if self.consumed.is_consumed(&record.payload.license_id) {
            debug!("License {} is consumed", record.payload.license_id);
            self.advance_last_seen(&mut record, dirty, fingerprint_hash, now);
            return LicenseEvaluation::Expired(record.payload);
        }

        let payload = match self
            .verifier
            .verify(&record.key, self.identity.fingerprint(), now)
        {
            Ok(payload) => payload,
            Err(RejectReason::Expired) => {
                if let Err(e) = self.consumed.mark_consumed(&record.payload.license_id) {
                    warn!("Failed to record consumed license: {}", e);
                }
                self.advance_last_seen(&mut record, dirty, fingerprint_hash, now);
                return LicenseEvaluation::Expired(record.payload);
            }
            Err(reason) => {
                info!("Stored license rejected: {}", reason.code());
                return LicenseEvaluation::Invalid(reason);
            }
        };

        if payload != record.payload {
            warn!("Stored payload differs from its token");
            return LicenseEvaluation::Invalid(RejectReason::TamperHmac);
        }

        let tolerance = Duration::hours(self.config.rollback_tolerance_hours);
        if now + tolerance < record.last_seen {
            warn!(
                "Clock is {} hours behind last license check",
                (record.last_seen - now).num_hours()
            );
            return LicenseEvaluation::Invalid(RejectReason::ClockRollback);
        }

        self.advance_last_seen(&mut record, dirty, fingerprint_hash, now);
        LicenseEvaluation::Valid(payload)
    }

    /// Moves `last_seen` forward to `now`, at most once per write interval,
    /// and persists the record if anything changed.
    fn advance_last_seen(
        &mut self,
        record: &mut LicenseRecord,
        mut dirty: bool,
        fingerprint_hash: &str,
        now: DateTime<Utc>,
    ) {
        let interval = Duration::minutes(self.config.last_seen_write_interval_mins);
        if now - record.last_seen >= interval {
            record.last_seen = now;
            dirty = true;
        }
        if !dirty {
            return;
        }
        match self
            .records
            .save_user(record, &mut self.user_keys, fingerprint_hash)
        {
            Ok(()) => debug!("License last_seen advanced"),
            Err(e) => warn!("Failed to update license record: {}", e),
        }
        self.save_mirror(record, fingerprint_hash);
    }

    /// Restores the per-user record from the machine mirror after
    /// re-verifying its token. Expired licenses are restored too, so they
    /// still reach the consumed ledger.
    fn restore_from_mirror(
        &mut self,
        fingerprint_hash: &str,
        now: DateTime<Utc>,
    ) -> MirrorRestore {
        let mut record = match self
            .records
            .load_mirror(&mut self.machine_keys, fingerprint_hash)
        {
            RecordLoad::Found { record, .. } => record,
            RecordLoad::Missing => return MirrorRestore::Absent,
            RecordLoad::Corrupt(e) => {
                warn!("License mirror unreadable: {}", e);
                return MirrorRestore::Unreadable;
            }
        };

        let payload = match self.verifier.decode(&record.key) {
            Ok(payload) => payload,
            Err(reason) => {
                warn!("License mirror rejected: {}", reason.code());
                return MirrorRestore::Absent;
            }
        };
        match self
            .verifier
            .check_binding(&payload, self.identity.fingerprint(), now)
        {
            Ok(()) | Err(RejectReason::Expired) => {}
            Err(reason) => {
                warn!("License mirror rejected: {}", reason.code());
                return MirrorRestore::Absent;
            }
        }

        record.payload = payload;
        if let Err(e) = record.restamp(&mut self.user_keys) {
            warn!("Cannot restamp restored license: {}", e);
            return MirrorRestore::Absent;
        }
        match self
            .records
            .save_user(&record, &mut self.user_keys, fingerprint_hash)
        {
            Ok(()) => info!("Restored license record from machine mirror"),
            Err(e) => warn!("Failed to write restored license record: {}", e),
        }
        MirrorRestore::Restored(record)
    }

    fn save_mirror(&mut self, record: &LicenseRecord, fingerprint_hash: &str) {
        if let Err(e) = self
            .records
            .save_mirror(record, &mut self.machine_keys, fingerprint_hash)
        {
            warn!("Machine-wide license mirror not written: {}", e);
        }
    }

    fn warn_if_degraded(&mut self) {
        if self.secret_source != SecretSource::Fallback {
            return;
        }
        let due = self
            .last_degraded_warning
            .is_none_or(|at| at.elapsed() >= DEGRADED_WARNING_INTERVAL);
        if due {
            warn!("OS data protection unavailable; state is sealed with the fallback secret");
            self.last_degraded_warning = Some(Instant::now());
        }
    }
}

impl std::fmt::Debug for EntitlementContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntitlementContext")
            .field("paths", &self.paths)
            .field("identity", &self.identity)
            .field("secret_source", &self.secret_source)
            .finish_non_exhaustive()
    }
}
