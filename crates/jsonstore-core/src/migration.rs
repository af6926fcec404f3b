//! Type migration for stored entries
//!
//! When a value type is renamed or reshaped, entries already on disk still
//! carry the old type name. A `TypeMigrator` registered for that old name
//! upgrades the payload the first time the entry is read; the storage engine
//! writes the result back so each entry is migrated at most once.

use std::fmt;

use hashbrown::HashMap;
use serde_json::Value;

use crate::error::{StoreError, StoreResult};

/// Raised by a migrator that cannot transform a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationError {
    pub message: String,
}

impl MigrationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl fmt::Display for MigrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for MigrationError {}

/// Upgrades entries stored under an obsolete type name.
pub trait TypeMigrator: Send + Sync {
    /// The obsolete type name this migrator handles.
    fn old_type(&self) -> &str;

    /// The type name migrated entries are stored under.
    fn new_type(&self) -> &str;

    /// Transform a payload of the old shape into one of the new type.
    fn migrate(&self, value: Value) -> Result<Value, MigrationError>;
}

/// A pure rename: the payload shape did not change, only the type name.
#[derive(Debug, Clone)]
pub struct RenameMigrator {
    old_type: String,
    new_type: String,
}

impl RenameMigrator {
    pub fn new(old_type: impl Into<String>, new_type: impl Into<String>) -> Self {
        Self { old_type: old_type.into(), new_type: new_type.into() }
    }
}

impl TypeMigrator for RenameMigrator {
    fn old_type(&self) -> &str { &self.old_type }

    fn new_type(&self) -> &str { &self.new_type }

    fn migrate(&self, value: Value) -> Result<Value, MigrationError> {
        Ok(value)
    }
}

/// A migrator backed by a closure.
pub struct FnMigrator<F> {
    old_type: String,
    new_type: String,
    transform: F,
}

impl<F> FnMigrator<F>
where
    F: Fn(Value) -> Result<Value, MigrationError> + Send + Sync,
{
    pub fn new(old_type: impl Into<String>, new_type: impl Into<String>, transform: F) -> Self {
        Self { old_type: old_type.into(), new_type: new_type.into(), transform }
    }
}

impl<F> TypeMigrator for FnMigrator<F>
where
    F: Fn(Value) -> Result<Value, MigrationError> + Send + Sync,
{
    fn old_type(&self) -> &str { &self.old_type }

    fn new_type(&self) -> &str { &self.new_type }

    fn migrate(&self, value: Value) -> Result<Value, MigrationError> {
        (self.transform)(value)
    }
}

/// Registered migrators, indexed by the old type name they handle.
#[derive(Default)]
pub struct Migrators {
    by_old_type: HashMap<String, Box<dyn TypeMigrator>>,
}

impl Migrators {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a migrator. A later migrator for the same old type replaces the earlier one.
    pub fn add(&mut self, migrator: impl TypeMigrator + 'static) {
        self.add_boxed(Box::new(migrator));
    }

    pub fn add_boxed(&mut self, migrator: Box<dyn TypeMigrator>) {
        self.by_old_type.insert(migrator.old_type().to_string(), migrator);
    }

    pub fn with(mut self, migrator: impl TypeMigrator + 'static) -> Self {
        self.add(migrator);
        self
    }

    /// Whether entries of `type_name` need migrating before they can be read.
    pub fn is_obsolete(&self, type_name: &str) -> bool {
        self.by_old_type.contains_key(type_name)
    }

    pub fn len(&self) -> usize {
        self.by_old_type.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_old_type.is_empty()
    }

    /// Follow the migration chain from `type_name` until the type is current.
    ///
    /// Returns `None` when `type_name` is already current. A chain that visits
    /// more migrators than are registered must loop and is reported as
    /// `MigrationCycle`.
    pub fn resolve(&self, type_name: &str, value: &Value) -> StoreResult<Option<(String, Value)>> {
        let Some(first) = self.by_old_type.get(type_name) else {
            return Ok(None);
        };

        let mut migrator = first;
        let mut current = value.clone();
        let mut steps = 0usize;
        loop {
            current = migrator.migrate(current).map_err(|e| StoreError::Migration {
                old_type: migrator.old_type().to_string(),
                reason: e.message,
            })?;
            steps += 1;

            match self.by_old_type.get(migrator.new_type()) {
                Some(next) if steps < self.by_old_type.len() => migrator = next,
                Some(_) => {
                    return Err(StoreError::MigrationCycle { type_name: type_name.to_string() });
                }
                None => return Ok(Some((migrator.new_type().to_string(), current))),
            }
        }
    }
}

impl fmt::Debug for Migrators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut pairs: Vec<(&str, &str)> = self
            .by_old_type
            .values()
            .map(|m| (m.old_type(), m.new_type()))
            .collect();
        pairs.sort_unstable();
        f.debug_struct("Migrators").field("chains", &pairs).finish()
    }
}
