//! The storage engine: a typed key-value table persisted as one JSON file.
//!
//! **Read path**: in-memory table; obsolete entries are migrated on first read
//! and written back.
//! **Write path**: replace the entry in memory, then schedule a deferred commit.
//! **Commit**: a debounced flush serializes the whole table once and writes it
//! to the primary file and a fresh backup, then prunes old backups.
//!
//! ```text
//!   put/remove ──> table ──> deferred_commit ──(write_delay)──> flush
//!                                 │                               │
//!                                 └─(streak > max_deferred)───────┤
//!                                                                 ▼
//!                                          things.json + backup/<ms>--things.json
//! ```

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, trace, warn};

use crate::backup::BackupManager;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::entry::{decode_table, encode_table, StorageEntry, Table};
use crate::error::{StoreError, StoreResult};
use crate::fsio::write_durable;
use crate::migration::{Migrators, TypeMigrator};
use crate::registry::{Storable, TypeRegistry};
use crate::scheduler::{Scheduler, TaskHandle, ThreadScheduler};

/// Name of the commit thread spawned when no scheduler is supplied.
const COMMIT_THREAD_NAME: &str = "jsonstore-commit";

/// Where the table came from when the store was opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadSource {
    /// The primary file parsed cleanly
    Primary,
    /// The primary was missing or corrupt; a backup was used
    Backup {
        /// 1 = most recent backup
        age: usize,
        path: PathBuf,
    },
    /// Nothing usable was found; the table started empty
    Empty,
}

/// Counters describing what the engine has done since it was opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Successful flushes (one primary write plus one backup each)
    pub flushes: u64,
    /// Flushes that failed and left the table dirty
    pub failed_flushes: u64,
    /// Entries rewritten under a new type by a migration
    pub migrations: u64,
}

/// Dirty tracking and the single pending-flush slot.
#[derive(Default)]
struct CommitState {
    dirty: bool,
    /// Clock reading at the first mutation of the current dirty streak
    deferred_since: Option<u64>,
    pending: Option<TaskHandle>,
}

/// The untyped half of the engine, shared with scheduled flush tasks.
struct Shared {
    path: PathBuf,
    config: Config,
    table: RwLock<Table>,
    commit: Mutex<CommitState>,
    backups: BackupManager,
    scheduler: Arc<dyn Scheduler>,
    clock: Arc<dyn Clock>,
    flushes: AtomicU64,
    failed_flushes: AtomicU64,
    migrations: AtomicU64,
}

impl Shared {
    /// Mark the table dirty and (re)schedule a flush.
    ///
    /// If the current dirty streak has already been deferred for longer than
    /// `max_deferred_period`, flush synchronously instead.
    fn deferred_commit(self: &Arc<Self>) {
        let mut state = self.commit.lock();
        state.dirty = true;

        if let Some(pending) = state.pending.take() {
            pending.cancel();
        }

        let now = self.clock.now_millis();
        let ceiling = u64::try_from(self.config.max_deferred_period.as_millis()).unwrap_or(u64::MAX);
        let since = state.deferred_since;
        match since {
            Some(since) if now.saturating_sub(since) > ceiling => {
                debug!(path = %self.path.display(), deferred_ms = now - since, "Deferred too long, flushing now");
                // Errors are logged and counted inside; the table stays dirty.
                let _ = self.flush_locked(&mut state);
                return;
            }
            Some(_) => {}
            None => state.deferred_since = Some(now),
        }

        let weak = Arc::downgrade(self);
        let task = Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                let _ = shared.flush();
            }
        });
        state.pending = Some(self.scheduler.schedule(task, self.config.write_delay));
    }

    fn flush(&self) -> StoreResult<()> {
        let mut state = self.commit.lock();
        self.flush_locked(&mut state)
    }

    fn flush_locked(&self, state: &mut CommitState) -> StoreResult<()> {
        if let Some(pending) = state.pending.take() {
            pending.cancel();
        }
        if !state.dirty {
            return Ok(());
        }

        let encoded = {
            let table = self.table.read();
            encode_table(&table)
        };
        let result = encoded
            .map_err(|e| StoreError::Serialization { reason: e.to_string() })
            .and_then(|bytes| self.write_snapshot(&bytes));
        state.deferred_since = None;

        match result {
            Ok(()) => {
                state.dirty = false;
                self.flushes.fetch_add(1, Ordering::Relaxed);
                debug!(path = %self.path.display(), "Flushed storage");
                Ok(())
            }
            Err(e) => {
                self.failed_flushes.fetch_add(1, Ordering::Relaxed);
                error!(path = %self.path.display(), error = %e, "Flush failed, will retry");
                Err(e)
            }
        }
    }

    /// Write the primary file and, from the same bytes, a new backup.
    fn write_snapshot(&self, bytes: &[u8]) -> StoreResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| StoreError::Write {
                path: parent.to_path_buf(),
                reason: format!("Failed to create storage directory: {}", e),
            })?;
        }
        write_durable(&self.path, bytes)?;

        if self.config.max_backup_files > 0 {
            let backup = self.backups.write(bytes, self.clock.now_millis())?;
            trace!(backup = %backup.display(), "Wrote backup");
        }
        self.backups.prune(self.config.max_backup_files);
        Ok(())
    }
}

/// A file-backed, typed key-value store.
///
/// All methods take `&self`; the store can be shared between threads behind an
/// `Arc`. Mutations land in memory immediately and reach disk after
/// `Config::write_delay` of quiet, or synchronously once a dirty streak has
/// lasted longer than `Config::max_deferred_period`. Dropping the store
/// flushes anything outstanding.
pub struct JsonStorage<T: Storable> {
    shared: Arc<Shared>,
    registry: TypeRegistry<T>,
    migrators: Migrators,
    source: LoadSource,
}

impl<T: Storable + 'static> JsonStorage<T> {
    /// Start configuring a store backed by the file at `path`.
    pub fn builder<P: AsRef<Path>>(path: P) -> StorageBuilder<T> {
        StorageBuilder::new(path)
    }

    /// Open a store with no migrators, the system clock and its own commit thread.
    pub fn open<P: AsRef<Path>>(path: P, config: Config, registry: TypeRegistry<T>) -> StoreResult<Self> {
        StorageBuilder::new(path).config(config).registry(registry).open()
    }
}

impl<T: Storable> JsonStorage<T> {
    /// Store `value` under `key`, returning the value it replaced.
    ///
    /// `None` removes the key. The only error is a value that cannot be
    /// serialized; persistence failures are logged and retried.
    pub fn put(&self, key: &str, value: Option<T>) -> StoreResult<Option<T>> {
        let Some(value) = value else {
            return Ok(self.remove(key));
        };

        let payload = serde_json::to_value(&value)
            .map_err(|e| StoreError::Serialization { reason: e.to_string() })?;
        let entry = StorageEntry::new(value.type_name(), payload);

        let previous = self.shared.table.write().insert(key.to_string(), entry);
        self.shared.deferred_commit();
        Ok(previous.and_then(|old| self.decode_logged(key, &old)))
    }

    /// Remove `key`, returning the value it held.
    ///
    /// Removing an absent key changes nothing and schedules no flush.
    pub fn remove(&self, key: &str) -> Option<T> {
        let removed = self.shared.table.write().remove(key)?;
        self.shared.deferred_commit();
        self.decode_logged(key, &removed)
    }

    /// Read `key`, logging and swallowing decode or migration failures.
    pub fn get(&self, key: &str) -> Option<T> {
        match self.try_get(key) {
            Ok(value) => value,
            Err(e) => {
                error!(key, error = %e, "Couldn't read stored value");
                None
            }
        }
    }

    /// Read `key`, reporting why a present entry could not be decoded.
    ///
    /// An entry under an obsolete type is migrated, written back to the table
    /// and a flush is scheduled before it is decoded as the new type. A failed
    /// migration leaves the entry untouched.
    pub fn try_get(&self, key: &str) -> StoreResult<Option<T>> {
        let entry = match self.shared.table.read().get(key) {
            Some(entry) => entry.clone(),
            None => return Ok(None),
        };

        let Some((new_type, new_value)) = self.migrators.resolve(&entry.class, &entry.value)? else {
            return self.decode(&entry.class, entry.value).map(Some);
        };

        let migrated = StorageEntry::new(new_type, new_value);
        let replaced = {
            let mut table = self.shared.table.write();
            match table.get_mut(key) {
                // Only replace what we migrated; a concurrent put wins.
                Some(current) if *current == entry => {
                    *current = migrated.clone();
                    true
                }
                _ => false,
            }
        };
        if replaced {
            info!(key, from = %entry.class, to = %migrated.class, "Migrated stored value");
            self.shared.migrations.fetch_add(1, Ordering::Relaxed);
            self.shared.deferred_commit();
        }

        self.decode(&migrated.class, migrated.value).map(Some)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.shared.table.read().contains_key(key)
    }

    /// Snapshot of the current keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.shared.table.read().keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    /// `get` for every current key, in `keys()` order. Migrates as a side effect.
    pub fn values(&self) -> Vec<Option<T>> {
        self.keys().iter().map(|k| self.get(k)).collect()
    }

    pub fn len(&self) -> usize {
        self.shared.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.table.read().is_empty()
    }

    /// Write outstanding changes now.
    ///
    /// Cancels any scheduled flush. A clean table is not rewritten. On failure
    /// the table stays dirty and the next trigger retries.
    pub fn flush(&self) -> StoreResult<()> {
        self.shared.flush()
    }

    /// Whether there are changes not yet on disk.
    pub fn is_dirty(&self) -> bool {
        self.shared.commit.lock().dirty
    }

    pub fn stats(&self) -> FlushStats {
        FlushStats {
            flushes: self.shared.flushes.load(Ordering::Relaxed),
            failed_flushes: self.shared.failed_flushes.load(Ordering::Relaxed),
            migrations: self.shared.migrations.load(Ordering::Relaxed),
        }
    }

    /// Primary file path.
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn backups(&self) -> &BackupManager {
        &self.shared.backups
    }

    pub fn load_source(&self) -> &LoadSource {
        &self.source
    }

    fn decode(&self, type_name: &str, value: serde_json::Value) -> StoreResult<T> {
        let decoded = self.registry.decode(type_name, value)?;
        trace!(type_name, "Deserialized stored value");
        Ok(decoded)
    }

    /// Decode an entry that is leaving the table. Migrations apply in memory only.
    fn decode_logged(&self, key: &str, entry: &StorageEntry) -> Option<T> {
        let result = match self.migrators.resolve(&entry.class, &entry.value) {
            Ok(Some((new_type, new_value))) => self.decode(&new_type, new_value),
            Ok(None) => self.decode(&entry.class, entry.value.clone()),
            Err(e) => Err(e),
        };
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                error!(key, error = %e, "Couldn't deserialize previous value");
                None
            }
        }
    }
}

impl<T: Storable> Drop for JsonStorage<T> {
    fn drop(&mut self) {
        // Failures are already logged by flush.
        let _ = self.shared.flush();
    }
}

impl<T: Storable> fmt::Debug for JsonStorage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonStorage")
            .field("path", &self.shared.path)
            .field("entries", &self.len())
            .field("source", &self.source)
            .finish()
    }
}

/// Options for opening a `JsonStorage`.
pub struct StorageBuilder<T> {
    path: PathBuf,
    config: Config,
    registry: TypeRegistry<T>,
    migrators: Migrators,
    scheduler: Option<Arc<dyn Scheduler>>,
    clock: Option<Arc<dyn Clock>>,
}

impl<T: Storable + 'static> StorageBuilder<T> {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            config: Config::default(),
            registry: TypeRegistry::new(),
            migrators: Migrators::new(),
            scheduler: None,
            clock: None,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Type names the store can decode.
    pub fn registry(mut self, registry: TypeRegistry<T>) -> Self {
        self.registry = registry;
        self
    }

    pub fn migrator(mut self, migrator: impl TypeMigrator + 'static) -> Self {
        self.migrators.add(migrator);
        self
    }

    pub fn migrators(mut self, migrators: Migrators) -> Self {
        self.migrators = migrators;
        self
    }

    /// Run deferred flushes on `scheduler` instead of a dedicated thread.
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Load the table and start the store.
    ///
    /// Unreadable data never fails the open; the only errors are an invalid
    /// config or a commit thread that cannot be spawned.
    pub fn open(self) -> StoreResult<JsonStorage<T>> {
        self.config
            .validate()
            .map_err(|reason| StoreError::InvalidConfig { reason })?;

        let scheduler = match self.scheduler {
            Some(scheduler) => scheduler,
            None => Arc::new(ThreadScheduler::new(COMMIT_THREAD_NAME)?),
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let backups = BackupManager::for_primary(&self.path);

        let (table, source) = load(&self.path, &backups);
        debug!(path = %self.path.display(), entries = table.len(), source = ?source, "Opened Json storage");

        Ok(JsonStorage {
            shared: Arc::new(Shared {
                path: self.path,
                config: self.config,
                table: RwLock::new(table),
                commit: Mutex::new(CommitState::default()),
                backups,
                scheduler,
                clock,
                flushes: AtomicU64::new(0),
                failed_flushes: AtomicU64::new(0),
                migrations: AtomicU64::new(0),
            }),
            registry: self.registry,
            migrators: self.migrators,
            source,
        })
    }
}

/// Read the primary file, falling back to backups newest first.
fn load(path: &Path, backups: &BackupManager) -> (Table, LoadSource) {
    match read_primary(path) {
        Ok(table) => return (table, LoadSource::Primary),
        Err(StoreError::Io { kind: io::ErrorKind::NotFound, .. }) => {
            debug!(path = %path.display(), "Json storage file does not exist - checking for a backup");
        }
        Err(e) => {
            info!(path = %path.display(), error = %e, "Json storage file seems to be corrupt - checking for a backup");
        }
    }

    for (index, candidate) in backups.candidates().into_iter().enumerate() {
        match read_backup(&candidate) {
            Ok(table) => {
                info!(path = %candidate.display(), age = index + 1, "Json storage restored from backup");
                return (table, LoadSource::Backup { age: index + 1, path: candidate });
            }
            Err(e) => warn!(error = %e, "Skipping unusable backup"),
        }
    }

    (Table::new(), LoadSource::Empty)
}

fn read_primary(path: &Path) -> StoreResult<Table> {
    let bytes = fs::read(path).map_err(|e| StoreError::Io {
        path: Some(path.to_path_buf()),
        kind: e.kind(),
        message: e.to_string(),
    })?;
    decode_table(&bytes).map_err(|reason| StoreError::CorruptPrimaryFile {
        path: path.to_path_buf(),
        reason,
    })
}

fn read_backup(path: &Path) -> StoreResult<Table> {
    let bytes = fs::read(path).map_err(|e| StoreError::CorruptBackupFile {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    decode_table(&bytes).map_err(|reason| StoreError::CorruptBackupFile {
        path: path.to_path_buf(),
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BACKUP_DIR;
    use crate::clock::SimulatedClock;
    use crate::migration::{FnMigrator, MigrationError, RenameMigrator};
    use crate::scheduler::ManualScheduler;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        text: String,
    }

    impl Storable for Note {
        fn type_name(&self) -> &str { "test.Note" }
    }

    fn note(text: &str) -> Note {
        Note { text: text.to_string() }
    }

    struct Harness {
        dir: TempDir,
        sched: Arc<ManualScheduler>,
        clock: Arc<SimulatedClock>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                dir: TempDir::new().unwrap(),
                sched: Arc::new(ManualScheduler::new()),
                clock: Arc::new(SimulatedClock::new(1_000_000)),
            }
        }

        fn path(&self) -> PathBuf {
            self.dir.path().join("notes.json")
        }

        fn builder(&self) -> StorageBuilder<Note> {
            JsonStorage::builder(self.path())
                .config(Config::testing())
                .registry(TypeRegistry::new().with_self("test.Note"))
                .scheduler(self.sched.clone())
                .clock(self.clock.clone())
        }

        fn open(&self) -> JsonStorage<Note> {
            self.builder().open().unwrap()
        }
    }

    #[test]
    fn test_open_empty() {
        let h = Harness::new();
        let store = h.open();
        assert!(store.is_empty());
        assert!(!store.is_dirty());
        assert_eq!(store.load_source(), &LoadSource::Empty);
    }

    #[test]
    fn test_put_get() {
        let h = Harness::new();
        let store = h.open();
        assert_eq!(store.put("a", Some(note("hello"))).unwrap(), None);
        assert_eq!(store.get("a"), Some(note("hello")));
        assert!(store.contains_key("a"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_put_returns_previous() {
        let h = Harness::new();
        let store = h.open();
        store.put("a", Some(note("one"))).unwrap();
        assert_eq!(store.put("a", Some(note("two"))).unwrap(), Some(note("one")));
        assert_eq!(store.get("a"), Some(note("two")));
    }

    #[test]
    fn test_put_none_removes() {
        let h = Harness::new();
        let store = h.open();
        store.put("a", Some(note("one"))).unwrap();
        assert_eq!(store.put("a", None).unwrap(), Some(note("one")));
        assert!(!store.contains_key("a"));
    }

    #[test]
    fn test_put_schedules_one_flush() {
        let h = Harness::new();
        let store = h.open();
        store.put("a", Some(note("1"))).unwrap();
        store.put("b", Some(note("2"))).unwrap();
        assert!(store.is_dirty());
        assert_eq!(h.sched.pending(), 1, "reschedule must cancel the previous flush");
        assert_eq!(h.sched.last_delay(), Some(Config::testing().write_delay));

        assert_eq!(h.sched.run_pending(), 1);
        assert!(!store.is_dirty());
        assert_eq!(store.stats().flushes, 1);
        assert!(h.path().exists());
        assert_eq!(store.backups().count(), 1);
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let h = Harness::new();
        let store = h.open();
        assert_eq!(store.remove("missing"), None);
        assert!(!store.is_dirty());
        assert_eq!(h.sched.pending(), 0);
    }

    #[test]
    fn test_remove_present() {
        let h = Harness::new();
        let store = h.open();
        store.put("a", Some(note("x"))).unwrap();
        store.flush().unwrap();
        assert_eq!(store.remove("a"), Some(note("x")));
        assert!(store.is_dirty());
        assert_eq!(h.sched.pending(), 1);
    }

    #[test]
    fn test_flush_clean_table_is_noop() {
        let h = Harness::new();
        let store = h.open();
        store.flush().unwrap();
        assert_eq!(store.stats().flushes, 0);
        assert!(!h.path().exists());
    }

    #[test]
    fn test_flush_cancels_scheduled() {
        let h = Harness::new();
        let store = h.open();
        store.put("a", Some(note("x"))).unwrap();
        store.flush().unwrap();
        assert_eq!(h.sched.pending(), 0);
        assert_eq!(h.sched.run_pending(), 0);
        assert_eq!(store.stats().flushes, 1);
    }

    #[test]
    fn test_deferred_ceiling_forces_flush() {
        let h = Harness::new();
        let store = h.open();
        store.put("a", Some(note("1"))).unwrap();
        h.clock.advance(Duration::from_millis(150));
        store.put("b", Some(note("2"))).unwrap();
        assert_eq!(store.stats().flushes, 0);

        h.clock.advance(Duration::from_millis(100));
        store.put("c", Some(note("3"))).unwrap();
        assert_eq!(store.stats().flushes, 1);
        assert!(!store.is_dirty());
        assert_eq!(h.sched.pending(), 0);

        // A new streak starts from scratch.
        store.put("d", Some(note("4"))).unwrap();
        assert_eq!(store.stats().flushes, 1);
        assert_eq!(h.sched.pending(), 1);
    }

    #[test]
    fn test_file_format() {
        let h = Harness::new();
        let store = h.open();
        store.put("a", Some(note("x"))).unwrap();
        store.flush().unwrap();

        let doc: serde_json::Value = serde_json::from_slice(&fs::read(h.path()).unwrap()).unwrap();
        assert_eq!(doc, json!({ "a": { "class": "test.Note", "value": { "text": "x" } } }));
        let backup = store.backups().backup_file(1).unwrap();
        assert_eq!(fs::read(backup).unwrap(), fs::read(h.path()).unwrap());
    }

    #[test]
    fn test_reopen_reads_primary() {
        let h = Harness::new();
        {
            let store = h.open();
            store.put("a", Some(note("kept"))).unwrap();
        }
        let store = h.open();
        assert_eq!(store.load_source(), &LoadSource::Primary);
        assert_eq!(store.get("a"), Some(note("kept")));
    }

    #[test]
    fn test_corrupt_primary_falls_back_to_backup() {
        let h = Harness::new();
        {
            let store = h.open();
            store.put("a", Some(note("v1"))).unwrap();
            store.flush().unwrap();
            h.clock.advance(Duration::from_millis(10));
            store.put("a", Some(note("v2"))).unwrap();
            store.flush().unwrap();
        }
        fs::write(h.path(), b"{ \"a\": ").unwrap();

        let store = h.open();
        assert!(matches!(store.load_source(), LoadSource::Backup { age: 1, .. }));
        assert_eq!(store.get("a"), Some(note("v2")));
    }

    #[test]
    fn test_skips_corrupt_backups() {
        let h = Harness::new();
        {
            let store = h.open();
            store.put("a", Some(note("old"))).unwrap();
            store.flush().unwrap();
        }
        let good = BackupManager::for_primary(&h.path()).backup_file(1).unwrap();
        let bad = BackupManager::for_primary(&h.path()).path_for(2_000_000);
        fs::write(&bad, b"").unwrap();
        fs::remove_file(h.path()).unwrap();

        let store = h.open();
        assert_eq!(store.load_source(), &LoadSource::Backup { age: 2, path: good });
        assert_eq!(store.get("a"), Some(note("old")));
    }

    #[test]
    fn test_everything_corrupt_starts_empty() {
        let h = Harness::new();
        fs::write(h.path(), b"not json").unwrap();
        let store = h.open();
        assert_eq!(store.load_source(), &LoadSource::Empty);
        assert!(store.is_empty());
    }

    #[test]
    fn test_unresolvable_type_reads_none() {
        let h = Harness::new();
        fs::write(
            h.path(),
            serde_json::to_vec(&json!({ "a": { "class": "test.Unknown", "value": {} } })).unwrap(),
        )
        .unwrap();
        let store = h.open();
        assert!(store.contains_key("a"));
        assert_eq!(store.get("a"), None);
        assert!(matches!(store.try_get("a"), Err(StoreError::UnresolvableType { .. })));
        assert!(store.contains_key("a"), "failed reads leave the entry in place");
        assert!(!store.is_dirty());
    }

    #[test]
    fn test_bad_payload_reads_none() {
        let h = Harness::new();
        fs::write(
            h.path(),
            serde_json::to_vec(&json!({ "a": { "class": "test.Note", "value": { "text": 5 } } })).unwrap(),
        )
        .unwrap();
        let store = h.open();
        assert!(matches!(store.try_get("a"), Err(StoreError::Deserialization { .. })));
        assert_eq!(store.values(), vec![None]);
    }

    fn write_legacy(h: &Harness) {
        fs::write(
            h.path(),
            serde_json::to_vec(&json!({ "a": { "class": "test.OldNote", "value": { "body": "hi" } } })).unwrap(),
        )
        .unwrap();
    }

    fn body_to_text(value: serde_json::Value) -> Result<serde_json::Value, MigrationError> {
        let body = value.get("body").cloned().ok_or_else(|| MigrationError::new("no body"))?;
        Ok(json!({ "text": body }))
    }

    #[test]
    fn test_get_migrates_and_writes_back() {
        let h = Harness::new();
        write_legacy(&h);
        let store = h
            .builder()
            .migrator(FnMigrator::new("test.OldNote", "test.Note", body_to_text))
            .open()
            .unwrap();

        assert_eq!(store.get("a"), Some(note("hi")));
        assert!(store.is_dirty());
        assert_eq!(store.stats().migrations, 1);
        assert_eq!(h.sched.pending(), 1);

        // Second read finds the current type.
        assert_eq!(store.get("a"), Some(note("hi")));
        assert_eq!(store.stats().migrations, 1);
    }

    #[test]
    fn test_failed_migration_leaves_entry() {
        let h = Harness::new();
        fs::write(
            h.path(),
            serde_json::to_vec(&json!({ "a": { "class": "test.OldNote", "value": { "nobody": 1 } } })).unwrap(),
        )
        .unwrap();
        let store = h
            .builder()
            .migrator(FnMigrator::new("test.OldNote", "test.Note", body_to_text))
            .open()
            .unwrap();

        assert!(matches!(store.try_get("a"), Err(StoreError::Migration { .. })));
        assert_eq!(store.get("a"), None);
        assert!(!store.is_dirty());
        assert_eq!(store.stats().migrations, 0);
    }

    #[test]
    fn test_remove_migrates_without_write_back() {
        let h = Harness::new();
        write_legacy(&h);
        let store = h
            .builder()
            .migrator(FnMigrator::new("test.OldNote", "test.Note", body_to_text))
            .open()
            .unwrap();

        assert_eq!(store.remove("a"), Some(note("hi")));
        assert_eq!(store.stats().migrations, 0);
        assert!(store.is_empty());
    }

    #[test]
    fn test_rename_migration_then_unknown_target() {
        let h = Harness::new();
        write_legacy(&h);
        let store = h
            .builder()
            .migrator(RenameMigrator::new("test.OldNote", "test.Gone"))
            .open()
            .unwrap();

        // The entry is rewritten before decoding fails.
        assert!(matches!(store.try_get("a"), Err(StoreError::UnresolvableType { .. })));
        assert_eq!(store.stats().migrations, 1);
    }

    #[test]
    fn test_drop_flushes() {
        let h = Harness::new();
        {
            let store = h.open();
            store.put("a", Some(note("x"))).unwrap();
            assert!(!h.path().exists());
        }
        assert!(h.path().exists());
        assert_eq!(h.sched.run_pending(), 0, "scheduled flush was cancelled by the final flush");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let h = Harness::new();
        let err = h
            .builder()
            .config(Config::testing().with_write_delay(Duration::from_secs(10)))
            .open()
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidConfig { .. }));
    }

    #[test]
    fn test_write_failure_keeps_dirty() {
        let h = Harness::new();
        // A directory where the primary file should be makes the rename fail.
        fs::create_dir_all(h.path()).unwrap();
        let store = h.open();
        store.put("a", Some(note("x"))).unwrap();

        assert!(matches!(store.flush(), Err(StoreError::Write { .. })));
        assert!(store.is_dirty());
        assert_eq!(store.stats().failed_flushes, 1);

        fs::remove_dir_all(h.path()).unwrap();
        store.flush().unwrap();
        assert!(!store.is_dirty());
        assert_eq!(store.get("a"), Some(note("x")));
    }

    #[test]
    fn test_keys_sorted_snapshot() {
        let h = Harness::new();
        let store = h.open();
        for k in ["c", "a", "b"] {
            store.put(k, Some(note(k))).unwrap();
        }
        assert_eq!(store.keys(), vec!["a", "b", "c"]);
        assert_eq!(store.values(), vec![Some(note("a")), Some(note("b")), Some(note("c"))]);
    }

    #[test]
    fn test_zero_backups_writes_primary_and_prunes() {
        let h = Harness::new();
        let seeded = BackupManager::for_primary(&h.path()).write(b"{}", 5).unwrap();
        let store = h
            .builder()
            .config(Config::testing().with_max_backup_files(0))
            .open()
            .unwrap();
        store.put("a", Some(note("x"))).unwrap();
        store.flush().unwrap();

        assert!(h.path().exists());
        assert!(!seeded.exists());
        assert_eq!(store.backups().count(), 0);
        assert_eq!(store.stats().flushes, 1);
    }

    #[test]
    fn test_dashed_primary_name_prunes_and_recovers() {
        let h = Harness::new();
        let path = h.dir.path().join("my--store.json");
        let open = || {
            JsonStorage::<Note>::builder(&path)
                .config(Config::testing().with_max_backup_files(2))
                .registry(TypeRegistry::new().with_self("test.Note"))
                .scheduler(h.sched.clone())
                .clock(h.clock.clone())
                .open()
                .unwrap()
        };
        {
            let store = open();
            for i in 0..6 {
                store.put("a", Some(note(&format!("v{}", i)))).unwrap();
                store.flush().unwrap();
                h.clock.advance(Duration::from_millis(10));
            }
            assert_eq!(store.backups().count(), 2);
        }
        let on_disk = fs::read_dir(h.dir.path().join(BACKUP_DIR)).unwrap().count();
        assert_eq!(on_disk, 2);

        fs::write(&path, b"").unwrap();
        let store = open();
        assert!(matches!(store.load_source(), LoadSource::Backup { age: 1, .. }));
        assert_eq!(store.get("a"), Some(note("v5")));
    }

    #[test]
    fn test_unbounded_delays_do_not_panic() {
        let h = Harness::new();
        let config = Config::testing()
            .with_write_delay(Duration::MAX)
            .with_max_deferred_period(Duration::MAX);
        let sched = Arc::new(ThreadScheduler::new("jsonstore-test").unwrap());
        let store = h.builder().config(config).scheduler(sched.clone()).open().unwrap();

        store.put("a", Some(note("x"))).unwrap();
        h.clock.advance(Duration::from_secs(3600));
        store.put("b", Some(note("y"))).unwrap();
        assert_eq!(sched.pending(), 1);
        assert_eq!(store.stats().flushes, 0);

        store.flush().unwrap();
        assert!(!store.is_dirty());
        assert_eq!(sched.pending(), 0);
    }
}
