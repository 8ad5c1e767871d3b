//! Trial accounting, license verification and activation.
//!
//! This crate decides whether an installation is inside its trial, holds a
//! valid signed license, or must stop. It handles:
//! - Machine fingerprinting for state and license binding
//! - A per-user secret protected by the OS, with a deterministic fallback
//! - Redundant day stamps that survive profile wipes and detect rollback
//! - Ed25519 license token verification
//! - A machine-wide ledger of consumed licenses
//!
//! # Design Principles
//!
//! - **Never brick a legitimate user**: storage failures degrade, they do not
//!   deny service
//! - **Repair drift, flag structure**: mirrors that are missing or stale are
//!   rewritten; only deliberately altered identity fields count as tamper
//! - **Only time expires**: tamper and clock flags are reported, but only
//!   elapsed calendar days end a trial
//! - **Offline**: no network calls
//!
//! # License Key Format
//!
//! Keys are formatted as: `base64url(payload).base64url(signature)`
//! The payload is a JSON object signed with Ed25519 over its raw bytes.

mod activation;
mod clock;
mod config;
mod consumed;
mod device;
mod error;
mod key;
mod keys;
mod manager;
mod rate_limit;
mod secret;
mod stamp;
mod storage;
mod trial;

pub use activation::{LicenseRecord, LicenseRecordStore, RecordLoad};
pub use clock::{
    Clock, ManualClock, SystemClock, calendar_days_between, local_day, start_of_local_day,
};
pub use config::{
    DEFAULT_APP_NAME, EMBEDDED_PUBLIC_KEY, EntitlementConfig, PublicKeyConfig, RateLimitConfig,
    StoragePaths, decode_public_key,
};
pub use consumed::ConsumedLicenseLedger;
pub use device::{
    DeviceInfo, HardwareId, MachineIdentity, NativeIdentityProvider, PlatformIdentityProvider,
    compute_fingerprint,
};
pub use error::{LicenseError, LicenseResult, RejectReason};
pub use key::{
    DEFAULT_MAX_PAYLOAD_SEGMENT, LicensePayload, LicenseTokenVerifier, REQUIRED_FIELDS, normalize,
};
pub use keys::KeyRing;
pub use manager::{
    ActivationResult, EntitlementContext, EntitlementContextBuilder, EntitlementStatus,
    LicenseState, LicenseSummary,
};
pub use rate_limit::TokenBucket;
pub use secret::{
    APP_PEPPER, OsSecureStorage, SECRET_SIZE, Secret, SecretSource, SecretStore, SecureStorage,
};
pub use stamp::{
    PlainStamp, RedundantStampStore, STAMP_VERSION, StampLocation, StampReport, StampSlot,
};
pub use storage::{ReadOutcome, read as read_state, remove as remove_state, write_atomic};
pub use trial::{TrialLedger, TrialState, TrialStatus};
