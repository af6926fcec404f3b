//! Durable file replacement
//!
//! Snapshots go to a sibling temp file, are synced to the device and then
//! renamed over the target. A reader sees either the old document or the new
//! one, never a prefix.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::{StoreError, StoreResult};

/// Suffix of the temp file used while replacing a snapshot.
const TMP_SUFFIX: &str = ".tmp";

#[cfg(target_os = "linux")]
fn sync_contents(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    // SAFETY: the descriptor belongs to `file`, which is borrowed for the call.
    os_result(unsafe { libc::fdatasync(file.as_raw_fd()) } == 0)
}

/// fsync on Apple platforms stops at the drive cache; F_FULLFSYNC does not.
#[cfg(any(target_os = "macos", target_os = "ios"))]
fn sync_contents(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    // SAFETY: the descriptor belongs to `file`, which is borrowed for the call.
    os_result(unsafe { libc::fcntl(file.as_raw_fd(), libc::F_FULLFSYNC) } != -1)
}

#[cfg(windows)]
fn sync_contents(file: &File) -> io::Result<()> {
    use std::os::windows::io::AsRawHandle;
    // SAFETY: the handle belongs to `file`, which is borrowed for the call.
    os_result(unsafe { winapi::um::fileapi::FlushFileBuffers(file.as_raw_handle().cast()) } != 0)
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios", windows)))]
fn sync_contents(file: &File) -> io::Result<()> {
    file.sync_data()
}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "ios", windows))]
fn os_result(ok: bool) -> io::Result<()> {
    if ok {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Replace `path` with `bytes` via temp file + sync + rename.
pub fn write_durable(path: &Path, bytes: &[u8]) -> StoreResult<()> {
    let tmp = tmp_path(path);
    let write_err = |e: io::Error| StoreError::Write {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };

    if let Err(e) = replace_via(&tmp, path, bytes) {
        let _ = fs::remove_file(&tmp);
        return Err(write_err(e));
    }

    sync_parent_dir(path).map_err(write_err)
}

fn replace_via(tmp: &Path, path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(tmp)?;
    file.write_all(bytes)?;
    file.flush()?;
    sync_contents(&file)?;
    drop(file);
    fs::rename(tmp, path)
}

/// Sync the directory entry so the rename itself survives power loss.
#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => File::open(dir)?.sync_all(),
        _ => Ok(()),
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(TMP_SUFFIX);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sync_contents() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{\"a\": 1}").unwrap();
        sync_contents(file.as_file()).unwrap();
    }

    #[test]
    fn test_write_durable_replaces_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("things.json");

        write_durable(&path, b"{\"a\": 1}").unwrap();
        write_durable(&path, b"{}").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"{}");
        assert!(!tmp_path(&path).exists(), "temp file should be renamed away");
    }

    #[test]
    fn test_write_durable_into_missing_dir_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing").join("things.json");

        let err = write_durable(&path, b"{}").unwrap_err();
        match err {
            StoreError::Write { path: p, .. } => assert_eq!(p, path),
            other => panic!("Expected Write error, got {:?}", other),
        }
    }
}
