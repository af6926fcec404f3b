//! jsonstore core: a durable, file-backed JSON key-value store
//!
//! Values live in an in-memory table and are persisted as one pretty-printed
//! JSON document. Writes are batched; rotating snapshots next to the primary
//! file give crash recovery; stored types can evolve through migrators.
//!
//! # Architecture
//!
//! - **Read path**: serve from the in-memory table, migrating obsolete
//!   entries on first read and writing the result back
//! - **Write path**: update the table, then a debounced deferred commit
//! - **Flush**: serialize once, write primary + backup, prune old backups
//! - **Recovery**: on open, fall back from a missing or corrupt primary to
//!   the newest readable backup
//!
//! # Example
//!
//! ```no_run
//! use jsonstore_core::{Config, JsonStorage, Storable, TypeRegistry};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Thing { label: String }
//!
//! impl Storable for Thing {
//!     fn type_name(&self) -> &str { "example.Thing" }
//! }
//!
//! let store: JsonStorage<Thing> = JsonStorage::open(
//!     "/var/lib/example/things.json",
//!     Config::default(),
//!     TypeRegistry::new().with_self("example.Thing"),
//! )?;
//! store.put("lamp", Some(Thing { label: "Lamp".into() }))?;
//! store.flush()?;
//! # Ok::<(), jsonstore_core::StoreError>(())
//! ```

pub mod backup;
pub mod clock;
pub mod config;
pub mod entry;
pub mod error;
pub mod fsio;
pub mod migration;
pub mod registry;
pub mod scheduler;
pub mod storage;

// Re-export key types for convenience
pub use backup::BackupManager;
pub use clock::{Clock, SimulatedClock, SystemClock};
pub use config::Config;
pub use entry::{StorageEntry, Table};
pub use error::{StoreError, StoreResult};
pub use migration::{FnMigrator, MigrationError, Migrators, RenameMigrator, TypeMigrator};
pub use registry::{Storable, TypeRegistry};
pub use scheduler::{ManualScheduler, Scheduler, Task, TaskHandle, ThreadScheduler};
pub use storage::{FlushStats, JsonStorage, LoadSource, StorageBuilder};
