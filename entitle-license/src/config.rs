//! Engine configuration.
//!
//! [`EntitlementConfig`] is resolved once at startup, optionally from a TOML
//! file, and handed to [`EntitlementContext`](crate::EntitlementContext).
//!
//! ```toml
//! app_name = "Acme"
//! trial_days = 30
//! allow_support_tools = false
//!
//! [rate_limit]
//! capacity = 10
//! refill_per_minute = 10
//!
//! [public_key]
//! key_file = "/etc/acme/license.pub"
//! ```

use crate::error::{LicenseError, LicenseResult};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use ed25519_dalek::VerifyingKey;
use ed25519_dalek::pkcs8::DecodePublicKey;
use entitle_crypto::KdfParams;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Embedded Ed25519 public key used when no other source is configured.
pub const EMBEDDED_PUBLIC_KEY: [u8; 32] = [
    28, 56, 150, 96, 148, 188, 63, 190, 64, 215, 193, 128, 232, 108, 101, 115, 38, 51, 46, 1, 40,
    121, 235, 223, 185, 236, 159, 197, 49, 162, 3, 114,
];

/// Default application name, used for storage directories.
pub const DEFAULT_APP_NAME: &str = "Entitle";

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EntitlementConfig {
    /// Application name; names the storage directories.
    pub app_name: String,
    /// Length of the trial in calendar days.
    pub trial_days: i64,
    /// How far the clock may sit behind a license's `last_seen`.
    pub rollback_tolerance_hours: i64,
    /// Minimum interval between `last_seen` writes.
    pub last_seen_write_interval_mins: i64,
    /// Clock-skew allowance before `issued_at`.
    pub not_before_grace_hours: i64,
    /// Largest accepted base64url payload segment, in characters.
    pub max_payload_segment: usize,
    /// Activation throttling.
    pub rate_limit: RateLimitConfig,
    /// Key derivation cost.
    pub kdf: KdfParams,
    /// Storage locations; platform defaults when unset.
    pub paths: Option<StoragePaths>,
    /// Where the license verification key comes from.
    pub public_key: PublicKeyConfig,
    /// Permits `reset_trial` and `deactivate` where they are compiled in.
    pub allow_support_tools: bool,
}

impl Default for EntitlementConfig {
    fn default() -> Self {
        Self {
            app_name: DEFAULT_APP_NAME.to_string(),
            trial_days: 30,
            rollback_tolerance_hours: 48,
            last_seen_write_interval_mins: 60,
            not_before_grace_hours: 24,
            max_payload_segment: 4096,
            rate_limit: RateLimitConfig::default(),
            kdf: KdfParams::default(),
            paths: None,
            public_key: PublicKeyConfig::default(),
            allow_support_tools: false,
        }
    }
}

impl EntitlementConfig {
    /// Loads configuration from a TOML file.
    ///
    /// A missing or unparsable file yields the defaults; the engine must
    /// start either way.
    pub fn load_from(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            info!("No entitlement config at {:?}, using defaults", path);
            return Self::default();
        }

        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<Self>(&contents) {
                Ok(config) => {
                    info!("Loaded entitlement config from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!(
                        "Failed to parse entitlement config {:?}: {}. Using defaults.",
                        path, e
                    );
                    Self::default()
                }
            },
            Err(e) => {
                warn!("Failed to read entitlement config {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    /// Returns the configured storage paths, or the platform defaults.
    #[must_use]
    pub fn storage_paths(&self) -> StoragePaths {
        self.paths
            .clone()
            .unwrap_or_else(|| StoragePaths::platform_default(&self.app_name))
    }
}

/// Token bucket settings for activation attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Maximum burst of attempts.
    pub capacity: u32,
    /// Tokens restored per minute.
    pub refill_per_minute: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_per_minute: 10,
        }
    }
}

/// The three storage roots.
///
/// `user_dir` holds per-user state, `crosscheck_dir` a second per-user stamp
/// in an unrelated directory, `machine_dir` state shared by all users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePaths {
    /// Per-user data directory.
    pub user_dir: PathBuf,
    /// Per-user directory for the cross-check stamp.
    pub crosscheck_dir: PathBuf,
    /// Machine-wide directory.
    pub machine_dir: PathBuf,
}

impl StoragePaths {
    /// Returns the platform locations for `app_name`.
    #[must_use]
    pub fn platform_default(app_name: &str) -> Self {
        let user_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(app_name);

        #[cfg(target_os = "macos")]
        let crosscheck_root = dirs::preference_dir();
        #[cfg(not(target_os = "macos"))]
        let crosscheck_root = dirs::config_dir();

        let crosscheck_dir = crosscheck_root
            .unwrap_or_else(|| PathBuf::from("."))
            .join(app_name);

        Self {
            user_dir,
            crosscheck_dir,
            machine_dir: machine_root().join(app_name),
        }
    }

    /// Places all three roots under one directory. Used by tests and
    /// portable installs.
    #[must_use]
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            user_dir: root.join("user"),
            crosscheck_dir: root.join("crosscheck"),
            machine_dir: root.join("machine"),
        }
    }

    /// Sealed license record.
    pub fn license_file(&self) -> PathBuf {
        self.user_dir.join("license.sealed")
    }

    /// Sealed trial state.
    pub fn trial_file(&self) -> PathBuf {
        self.user_dir.join("trial.sealed")
    }

    /// OS-protected per-user secret.
    pub fn secret_file(&self) -> PathBuf {
        self.user_dir.join("secret.bin")
    }

    /// Per-user day stamp.
    pub fn user_stamp_file(&self) -> PathBuf {
        self.user_dir.join("stamp.json")
    }

    /// Cross-check day stamp.
    pub fn crosscheck_stamp_file(&self) -> PathBuf {
        self.crosscheck_dir.join(".stamp")
    }

    /// Machine-wide mirror of the license record.
    pub fn license_mirror_file(&self) -> PathBuf {
        self.machine_dir.join("license.mirror")
    }

    /// Machine-wide consumed-license ledger.
    pub fn consumed_file(&self) -> PathBuf {
        self.machine_dir.join("consumed.json")
    }

    /// Per-user fallback copy of the consumed ledger.
    pub fn user_consumed_file(&self) -> PathBuf {
        self.user_dir.join("consumed.json")
    }

    /// Machine-wide day stamp.
    pub fn machine_stamp_file(&self) -> PathBuf {
        self.machine_dir.join("stamp.json")
    }
}

fn machine_root() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("ProgramData")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(r"C:\ProgramData"))
    }

    #[cfg(target_os = "macos")]
    {
        PathBuf::from("/Users/Shared")
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        PathBuf::from("/var/lib")
    }
}

/// Ordered sources for the license verification key.
///
/// Sources are tried in order: `inline`, the variable named by `env_var`,
/// `key_file`, then [`EMBEDDED_PUBLIC_KEY`]. A source that is configured but
/// holds an undecodable key is an error, not a reason to fall through.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublicKeyConfig {
    /// Key text (base64, hex or PEM).
    pub inline: Option<String>,
    /// Name of an environment variable holding key text.
    pub env_var: Option<String>,
    /// File holding key text.
    pub key_file: Option<PathBuf>,
}

impl PublicKeyConfig {
    /// Resolves the configured sources into a verifying key.
    pub fn resolve(&self) -> LicenseResult<VerifyingKey> {
        if let Some(text) = &self.inline {
            debug!("Using inline license public key");
            return decode_public_key(text, "inline");
        }

        if let Some(var) = &self.env_var {
            if let Ok(text) = std::env::var(var) {
                debug!("Using license public key from ${}", var);
                return decode_public_key(&text, &format!("env:{var}"));
            }
        }

        if let Some(path) = &self.key_file {
            let source = format!("file:{}", path.display());
            let text = std::fs::read_to_string(path).map_err(|e| {
                LicenseError::InvalidPublicKey {
                    source_name: source.clone(),
                    reason: e.to_string(),
                }
            })?;
            debug!("Using license public key from {:?}", path);
            return decode_public_key(&text, &source);
        }

        VerifyingKey::from_bytes(&EMBEDDED_PUBLIC_KEY).map_err(|e| {
            LicenseError::InvalidPublicKey {
                source_name: "embedded".to_string(),
                reason: e.to_string(),
            }
        })
    }
}

/// Decodes an Ed25519 public key from PEM, hex or base64 text.
pub fn decode_public_key(text: &str, source: &str) -> LicenseResult<VerifyingKey> {
    let invalid = |reason: String| LicenseError::InvalidPublicKey {
        source_name: source.to_string(),
        reason,
    };
    let text = text.trim();

    if text.starts_with("-----BEGIN") {
        return VerifyingKey::from_public_key_pem(text).map_err(|e| invalid(e.to_string()));
    }

    let bytes = if text.len() == 64 && text.chars().all(|c| c.is_ascii_hexdigit()) {
        hex::decode(text).map_err(|e| invalid(e.to_string()))?
    } else {
        [STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD]
            .iter()
            .find_map(|engine| engine.decode(text).ok())
            .ok_or_else(|| invalid("not base64, hex or PEM".to_string()))?
    };

    let bytes: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| invalid(format!("expected 32 bytes, got {}", bytes.len())))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| invalid(e.to_string()))
}
