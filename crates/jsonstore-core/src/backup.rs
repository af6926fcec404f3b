//! Rotating backup snapshots
//!
//! Every successful flush writes the same bytes as the primary file into
//! `<parent>/backup/<epoch_millis>--<file_name>`. The manager enumerates,
//! names and prunes those files. Backups are full snapshots; any single one is
//! enough to restore the table.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};

/// Name of the backup directory beside the primary file.
pub const BACKUP_DIR: &str = "backup";

/// Separator between the timestamp and the primary file name.
pub const SEPARATOR: &str = "--";

/// Names, enumerates and prunes the backups of one primary file.
#[derive(Debug, Clone)]
pub struct BackupManager {
    dir: PathBuf,
    file_name: String,
}

impl BackupManager {
    /// Backups for the primary file at `primary`.
    pub fn for_primary(primary: &Path) -> Self {
        let dir = primary
            .parent()
            .map(|p| p.join(BACKUP_DIR))
            .unwrap_or_else(|| PathBuf::from(BACKUP_DIR));
        let file_name = primary
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self { dir, file_name }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the backup taken at `millis`.
    pub fn path_for(&self, millis: u64) -> PathBuf {
        self.dir.join(format!("{}{}{}", millis, SEPARATOR, self.file_name))
    }

    /// Timestamps of all backups belonging to this primary file, oldest first.
    ///
    /// Files that belong to another primary, or whose timestamp part is not a
    /// number, are ignored.
    pub fn timestamps(&self) -> Vec<u64> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut times: Vec<u64> = entries
            .flatten()
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|e| e.file_name().to_str().and_then(|n| self.parse_name(n)))
            .collect();
        times.sort_unstable();
        times
    }

    fn parse_name(&self, name: &str) -> Option<u64> {
        // The primary name may itself contain the separator; split at the first one only.
        let (stamp, file_name) = name.split_once(SEPARATOR)?;
        if file_name != self.file_name {
            return None;
        }
        stamp.parse().ok()
    }

    pub fn count(&self) -> usize {
        self.timestamps().len()
    }

    /// The `age`-th most recent backup (1 = newest), if that many exist.
    pub fn backup_file(&self, age: usize) -> Option<PathBuf> {
        let times = self.timestamps();
        if age == 0 || times.len() < age {
            return None;
        }
        Some(self.path_for(times[times.len() - age]))
    }

    /// All backups, newest first.
    pub fn candidates(&self) -> Vec<PathBuf> {
        self.timestamps().into_iter().rev().map(|t| self.path_for(t)).collect()
    }

    /// Write a backup stamped `now`.
    ///
    /// If a backup at or after `now` already exists the stamp is moved just past
    /// it, so two flushes within the same millisecond never share a file.
    pub fn write(&self, bytes: &[u8], now: u64) -> StoreResult<PathBuf> {
        fs::create_dir_all(&self.dir).map_err(|e| StoreError::Write {
            path: self.dir.clone(),
            reason: format!("Failed to create backup directory: {}", e),
        })?;

        let stamp = match self.timestamps().last() {
            Some(&newest) if newest >= now => newest + 1,
            _ => now,
        };
        let path = self.path_for(stamp);
        fs::write(&path, bytes).map_err(|e| StoreError::Write {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        Ok(path)
    }

    /// Delete the oldest backups until at most `max` remain. Returns how many were deleted.
    pub fn prune(&self, max: usize) -> usize {
        let times = self.timestamps();
        if times.len() <= max {
            return 0;
        }

        let mut deleted = 0;
        for &stamp in &times[..times.len() - max] {
            let path = self.path_for(stamp);
            match fs::remove_file(&path) {
                Ok(()) => deleted += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete old backup"),
            }
        }
        debug!(dir = %self.dir.display(), deleted, "Pruned backups");
        deleted
    }
}
