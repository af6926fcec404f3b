//! Storage entries and the on-disk table format
//!
//! The primary file and every backup hold the same document: one pretty-printed
//! JSON object mapping each key to an envelope of its declared type and payload.
//!
//! ```text
//! {
//!   "living-room": {
//!     "class": "org.example.Thing",
//!     "value": { ... }
//!   }
//! }
//! ```
//!
//! Top-level keys are written in sorted order. Nested objects inside payloads
//! come out sorted as well because `serde_json::Value` keeps object members in
//! an ordered map, so two flushes of the same table produce identical bytes.

use std::collections::BTreeMap;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The envelope of one stored value: its declared type name and JSON payload.
///
/// Entries are never mutated; an update or a migration replaces the whole entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageEntry {
    /// Type name the payload decodes as (directly or via migration)
    pub class: String,
    /// Serialized payload
    pub value: Value,
}

impl StorageEntry {
    pub fn new(class: impl Into<String>, value: Value) -> Self {
        Self { class: class.into(), value }
    }
}

/// In-memory table of key -> entry.
pub type Table = HashMap<String, StorageEntry>;

/// Render the whole table as the on-disk document.
pub fn encode_table(table: &Table) -> Result<Vec<u8>, serde_json::Error> {
    let ordered: BTreeMap<&str, &StorageEntry> =
        table.iter().map(|(k, v)| (k.as_str(), v)).collect();
    let mut bytes = serde_json::to_vec_pretty(&ordered)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Parse an on-disk document back into a table.
///
/// An empty file is rejected: a zero-length primary is what a crash in the
/// middle of a write leaves behind. A literal `null` document is an empty table.
pub fn decode_table(bytes: &[u8]) -> Result<Table, String> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err("file is empty".to_string());
    }
    let parsed: Option<BTreeMap<String, StorageEntry>> =
        serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
    Ok(parsed.unwrap_or_default().into_iter().collect())
}
