//! Small-file persistence helpers.
//!
//! Every state file is replaced whole: written to a sibling temp file and
//! renamed over the target, so readers see the old or the new content.

use std::ffi::OsString;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

/// Result of reading one state file.
#[derive(Debug)]
pub enum ReadOutcome {
    /// The file exists and was read.
    Found(Vec<u8>),
    /// The file does not exist.
    Missing,
    /// The file (or its directory) cannot be accessed.
    Unavailable(io::Error),
}

/// Reads `path`, separating "absent" from "inaccessible".
pub fn read(path: &Path) -> ReadOutcome {
    match std::fs::read(path) {
        Ok(bytes) => ReadOutcome::Found(bytes),
        Err(e) if e.kind() == ErrorKind::NotFound => ReadOutcome::Missing,
        Err(e) => ReadOutcome::Unavailable(e),
    }
}

/// Atomically replaces `path` with `bytes`, creating parent directories.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp = temp_path(path);
    std::fs::write(&tmp, bytes)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

/// Removes `path`. A file that is already gone is not an error.
pub fn remove(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("state"));
    name.push(".tmp");
    path.with_file_name(name)
}
