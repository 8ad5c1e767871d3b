//! Machine identity for license and state binding.
//!
//! A fingerprint is the SHA-256 of a few labelled hardware/OS identifiers.
//! It is recomputed once per process, so hardware changes are noticed on the
//! next start, and it is never written to disk.

use entitle_crypto::sha256_hex;
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Information about the current device, for support diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Operating system name.
    pub os_name: String,
    /// Operating system version.
    pub os_version: String,
    /// Hostname.
    pub hostname: String,
    /// CPU architecture.
    pub arch: String,
}

impl DeviceInfo {
    /// Collects information about the current device.
    #[must_use]
    pub fn collect() -> Self {
        Self {
            os_name: env::consts::OS.to_string(),
            os_version: get_os_version(),
            hostname: get_hostname(),
            arch: env::consts::ARCH.to_string(),
        }
    }
}

/// One labelled machine identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareId {
    /// Stable label, part of the hashed input.
    pub label: &'static str,
    /// The identifier value.
    pub value: String,
}

impl HardwareId {
    /// Creates an identifier.
    pub fn new(label: &'static str, value: impl Into<String>) -> Self {
        Self {
            label,
            value: value.into(),
        }
    }
}

/// Source of raw machine identifiers.
///
/// Implementations return whatever subset is readable; an empty list means
/// the machine cannot be identified.
pub trait PlatformIdentityProvider: Send + Sync {
    /// Returns the identifiers available on this machine.
    fn identifiers(&self) -> Vec<HardwareId>;
}

/// The identity provider for the target OS.
///
/// - Windows: `MachineGuid`, SMBIOS product UUID, system volume serial
/// - macOS: `IOPlatformUUID`, `IOPlatformSerialNumber`, root volume UUID
/// - Linux: machine-id, DMI product UUID, root filesystem UUID
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeIdentityProvider;

impl PlatformIdentityProvider for NativeIdentityProvider {
    fn identifiers(&self) -> Vec<HardwareId> {
        native_identifiers()
            .into_iter()
            .filter(|id| !is_placeholder(&id.value))
            .collect()
    }
}

/// The current machine's fingerprint, computed at most once per process.
pub struct MachineIdentity {
    provider: Box<dyn PlatformIdentityProvider>,
    fingerprint: OnceLock<Option<String>>,
}

impl MachineIdentity {
    /// Creates an identity backed by `provider`.
    pub fn new(provider: Box<dyn PlatformIdentityProvider>) -> Self {
        Self {
            provider,
            fingerprint: OnceLock::new(),
        }
    }

    /// Creates an identity backed by the native provider.
    #[must_use]
    pub fn native() -> Self {
        Self::new(Box::new(NativeIdentityProvider))
    }

    /// Returns the fingerprint, or `None` when no identifier is available.
    ///
    /// `None` means "cannot verify"; it is never evidence of tampering.
    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint
            .get_or_init(|| {
                let ids = self.provider.identifiers();
                let fingerprint = compute_fingerprint(&ids);
                match &fingerprint {
                    Some(_) => debug!("Machine fingerprint derived from {} identifiers", ids.len()),
                    None => warn!("No machine identifiers available; fingerprint unavailable"),
                }
                fingerprint
            })
            .as_deref()
    }

    /// The string keys and associated data are bound to. Empty when the
    /// fingerprint is unavailable.
    pub fn binding(&self) -> &str {
        self.fingerprint().unwrap_or("")
    }

    /// Hex SHA-256 of [`binding`](Self::binding); the value stored in stamps
    /// and associated data.
    pub fn fingerprint_hash(&self) -> String {
        sha256_hex(self.binding().as_bytes())
    }
}

impl std::fmt::Debug for MachineIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineIdentity")
            .field("fingerprint", &self.fingerprint.get())
            .finish_non_exhaustive()
    }
}

/// Hashes `label=value` pairs joined with `|`. Returns `None` for an empty
/// identifier set.
pub fn compute_fingerprint(ids: &[HardwareId]) -> Option<String> {
    let parts: Vec<String> = ids
        .iter()
        .filter(|id| !id.value.trim().is_empty())
        .map(|id| format!("{}={}", id.label, id.value.trim()))
        .collect();

    if parts.is_empty() {
        return None;
    }
    Some(sha256_hex(parts.join("|").as_bytes()))
}

/// Firmware placeholder values that identify nothing.
fn is_placeholder(value: &str) -> bool {
    let v = value.trim();
    if v.is_empty() {
        return true;
    }
    let hex_only: String = v.chars().filter(|c| *c != '-').collect();
    let all = |ch: char| hex_only.chars().all(|c| c.eq_ignore_ascii_case(&ch));
    if !hex_only.is_empty() && (all('0') || all('f')) {
        return true;
    }
    const PLACEHOLDERS: &[&str] = &[
        "03000200-0400-0500-0006-000700080009",
        "to be filled by o.e.m.",
        "default string",
        "system serial number",
        "none",
        "unknown",
    ];
    PLACEHOLDERS.contains(&v.to_ascii_lowercase().as_str())
}

fn get_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

fn get_os_version() -> String {
    #[cfg(target_os = "macos")]
    {
        macos_native::sysctl_string(c"kern.osproductversion")
            .unwrap_or_else(|| "unknown".to_string())
    }

    #[cfg(target_os = "windows")]
    {
        windows_native::read_hklm_string(
            r"SOFTWARE\Microsoft\Windows NT\CurrentVersion",
            "DisplayVersion",
        )
        .unwrap_or_else(|| "unknown".to_string())
    }

    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string("/etc/os-release")
            .ok()
            .and_then(|content| {
                content
                    .lines()
                    .find(|l| l.starts_with("VERSION_ID="))
                    .map(|l| {
                        l.trim_start_matches("VERSION_ID=")
                            .trim_matches('"')
                            .to_string()
                    })
            })
            .unwrap_or_else(|| "unknown".to_string())
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows", target_os = "linux")))]
    {
        "unknown".to_string()
    }
}

#[cfg(target_os = "linux")]
fn native_identifiers() -> Vec<HardwareId> {
    let mut ids = Vec::new();

    if let Some(machine_id) = std::fs::read_to_string("/etc/machine-id")
        .or_else(|_| std::fs::read_to_string("/var/lib/dbus/machine-id"))
        .ok()
        .map(|s| s.trim().to_string())
    {
        ids.push(HardwareId::new("machine_id", machine_id));
    }

    // Readable by root only on most distributions.
    if let Ok(uuid) = std::fs::read_to_string("/sys/class/dmi/id/product_uuid") {
        ids.push(HardwareId::new("product_uuid", uuid.trim().to_ascii_lowercase()));
    }

    if let Some(uuid) = linux_root_fs_uuid() {
        ids.push(HardwareId::new("volume_uuid", uuid));
    }

    ids
}

/// Finds the UUID of the device mounted at `/` by matching the mount source
/// against the `/dev/disk/by-uuid` links.
#[cfg(target_os = "linux")]
fn linux_root_fs_uuid() -> Option<String> {
    let mountinfo = std::fs::read_to_string("/proc/self/mountinfo").ok()?;
    let source = mountinfo.lines().find_map(|line| {
        let (left, right) = line.split_once(" - ")?;
        let mount_point = left.split_whitespace().nth(4)?;
        if mount_point != "/" {
            return None;
        }
        right.split_whitespace().nth(1).map(str::to_string)
    })?;
    let device = std::fs::canonicalize(&source).ok()?;

    std::fs::read_dir("/dev/disk/by-uuid")
        .ok()?
        .filter_map(Result::ok)
        .find(|entry| std::fs::canonicalize(entry.path()).ok().as_ref() == Some(&device))
        .and_then(|entry| entry.file_name().into_string().ok())
}

#[cfg(target_os = "macos")]
fn native_identifiers() -> Vec<HardwareId> {
    let mut ids = Vec::new();

    if let Some(uuid) = macos_native::host_uuid() {
        ids.push(HardwareId::new("platform_uuid", uuid));
    }
    if let Some(model) = macos_native::sysctl_string(c"hw.model") {
        ids.push(HardwareId::new("hw_model", model));
    }

    ids
}

#[cfg(target_os = "windows")]
fn native_identifiers() -> Vec<HardwareId> {
    let mut ids = Vec::new();

    if let Some(guid) =
        windows_native::read_hklm_string(r"SOFTWARE\Microsoft\Cryptography", "MachineGuid")
    {
        ids.push(HardwareId::new("machine_guid", guid));
    }

    if let Some(uuid) = windows_native::read_hklm_string(r"SYSTEM\HardwareConfig", "LastConfig") {
        let uuid = uuid.trim_matches(|c| c == '{' || c == '}').to_ascii_lowercase();
        ids.push(HardwareId::new("product_uuid", uuid));
    }

    if let Some(serial) = windows_native::system_volume_serial() {
        ids.push(HardwareId::new("volume_serial", serial));
    }

    ids
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn native_identifiers() -> Vec<HardwareId> {
    Vec::new()
}

#[cfg(target_os = "macos")]
mod macos_native {
    use std::ffi::CStr;

    /// Hardware UUID, the value IOKit reports as `IOPlatformUUID`.
    pub fn host_uuid() -> Option<String> {
        let mut id = [0u8; 16];
        let timeout = libc::timespec {
            tv_sec: 1,
            tv_nsec: 0,
        };
        let status = unsafe { libc::gethostuuid(id.as_mut_ptr(), &timeout) };
        if status != 0 {
            return None;
        }

        let hex = hex::encode_upper(id);
        Some(format!(
            "{}-{}-{}-{}-{}",
            &hex[0..8],
            &hex[8..12],
            &hex[12..16],
            &hex[16..20],
            &hex[20..32]
        ))
    }

    /// Reads a string-valued sysctl such as `hw.model`.
    pub fn sysctl_string(name: &CStr) -> Option<String> {
        let mut len: libc::size_t = 0;
        let status = unsafe {
            libc::sysctlbyname(
                name.as_ptr(),
                std::ptr::null_mut(),
                &mut len,
                std::ptr::null_mut(),
                0,
            )
        };
        if status != 0 || len == 0 {
            return None;
        }

        let mut buffer = vec![0u8; len];
        let status = unsafe {
            libc::sysctlbyname(
                name.as_ptr(),
                buffer.as_mut_ptr().cast(),
                &mut len,
                std::ptr::null_mut(),
                0,
            )
        };
        if status != 0 {
            return None;
        }

        buffer.truncate(len);
        let value = CStr::from_bytes_until_nul(&buffer).ok()?.to_str().ok()?.trim();
        (!value.is_empty()).then(|| value.to_string())
    }
}

#[cfg(target_os = "windows")]
mod windows_native {
    use windows::Win32::Foundation::ERROR_SUCCESS;
    use windows::Win32::Storage::FileSystem::GetVolumeInformationW;
    use windows::Win32::System::Registry::{
        HKEY_LOCAL_MACHINE, RRF_RT_REG_SZ, RRF_SUBKEY_WOW6464KEY, RegGetValueW,
    };
    use windows::core::HSTRING;

    /// Reads a `REG_SZ` value under `HKEY_LOCAL_MACHINE` from the 64-bit view.
    pub fn read_hklm_string(subkey: &str, value: &str) -> Option<String> {
        let subkey = HSTRING::from(subkey);
        let value = HSTRING::from(value);
        let flags = RRF_RT_REG_SZ | RRF_SUBKEY_WOW6464KEY;

        let mut size: u32 = 0;
        let status = unsafe {
            RegGetValueW(HKEY_LOCAL_MACHINE, &subkey, &value, flags, None, None, Some(&mut size))
        };
        if status != ERROR_SUCCESS || size == 0 {
            return None;
        }

        let mut buffer = vec![0u16; (size as usize).div_ceil(2)];
        let status = unsafe {
            RegGetValueW(
                HKEY_LOCAL_MACHINE,
                &subkey,
                &value,
                flags,
                None,
                Some(buffer.as_mut_ptr().cast()),
                Some(&mut size),
            )
        };
        if status != ERROR_SUCCESS {
            return None;
        }

        let len = buffer.iter().position(|&c| c == 0).unwrap_or(buffer.len());
        String::from_utf16(&buffer[..len]).ok()
    }

    /// Serial number of the volume holding `%SystemDrive%`.
    pub fn system_volume_serial() -> Option<String> {
        let drive = std::env::var("SystemDrive").unwrap_or_else(|_| "C:".to_string());
        let root = HSTRING::from(format!("{drive}\\"));
        let mut serial: u32 = 0;
        unsafe { GetVolumeInformationW(&root, None, Some(&mut serial), None, None, None) }.ok()?;
        Some(format!("{serial:08X}"))
    }
}
