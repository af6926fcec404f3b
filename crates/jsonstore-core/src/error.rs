//! Error types for jsonstore operations
//!
//! Most of these never reach a caller of the storage engine: load-time
//! corruption falls back to older backups, read-time failures turn into
//! "no value" and write failures are logged and retried on the next flush.
//! They are still surfaced through the `try_*` entry points and `flush()`.

use std::error::Error;
use std::fmt;
use std::path::PathBuf;

/// jsonstore error types with detailed context
#[derive(Debug, Clone)]
pub enum StoreError {
    /// I/O operation failed
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// The primary data file exists but cannot be parsed
    CorruptPrimaryFile {
        /// Path to the primary file
        path: PathBuf,
        /// Why the file was rejected
        reason: String,
    },

    /// A backup snapshot exists but cannot be parsed
    CorruptBackupFile {
        /// Path to the backup file
        path: PathBuf,
        /// Why the file was rejected
        reason: String,
    },

    /// No decoder is registered for a stored type name
    UnresolvableType {
        /// The type name recorded in the entry
        type_name: String,
    },

    /// The payload does not match the shape of its declared type
    Deserialization {
        /// The type the payload was decoded as
        type_name: String,
        /// Decoder message
        reason: String,
    },

    /// A value could not be turned into a JSON tree
    Serialization {
        /// Encoder message
        reason: String,
    },

    /// A type migrator rejected the payload
    Migration {
        /// The obsolete type that was being migrated
        old_type: String,
        /// Migrator message
        reason: String,
    },

    /// Migrators form a loop and never reach a current type
    MigrationCycle {
        /// The type name the chain started from
        type_name: String,
    },

    /// Writing the primary file or a backup failed
    Write {
        /// File being written
        path: PathBuf,
        /// Underlying failure
        reason: String,
    },

    /// Configuration rejected by `Config::validate`
    InvalidConfig {
        /// Validation message
        reason: String,
    },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io { path, kind, message } => {
                if let Some(path) = path {
                    write!(f, "I/O error in {}: {} ({})", path.display(), message, kind)
                } else {
                    write!(f, "I/O error: {} ({})", message, kind)
                }
            }

            StoreError::CorruptPrimaryFile { path, reason } => {
                write!(f, "Storage file {} is corrupt: {}", path.display(), reason)
            }

            StoreError::CorruptBackupFile { path, reason } => {
                write!(f, "Backup file {} is corrupt: {}", path.display(), reason)
            }

            StoreError::UnresolvableType { type_name } => {
                write!(f, "No type registered under name '{}'", type_name)
            }

            StoreError::Deserialization { type_name, reason } => {
                write!(f, "Couldn't deserialize value of type '{}': {}", type_name, reason)
            }

            StoreError::Serialization { reason } => {
                write!(f, "Couldn't serialize value: {}", reason)
            }

            StoreError::Migration { old_type, reason } => {
                write!(f, "Type '{}' needs migration but migration failed: {}", old_type, reason)
            }

            StoreError::MigrationCycle { type_name } => {
                write!(f, "Migration chain starting at '{}' does not terminate", type_name)
            }

            StoreError::Write { path, reason } => {
                write!(f, "Error writing storage to {}: {}", path.display(), reason)
            }

            StoreError::InvalidConfig { reason } => {
                write!(f, "Invalid storage configuration: {}", reason)
            }
        }
    }
}

impl Error for StoreError {}

/// Convert std::io::Error to StoreError::Io
impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for jsonstore operations
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StoreError::Migration {
            old_type: "org.example.OldThing".to_string(),
            reason: "missing field 'uid'".to_string(),
        };

        let display = format!("{}", err);
        assert!(display.contains("needs migration"));
        assert!(display.contains("org.example.OldThing"));
        assert!(display.contains("missing field 'uid'"));
    }

    #[test]
    fn test_write_error_names_path() {
        let err = StoreError::Write {
            path: PathBuf::from("/var/lib/store/things.json"),
            reason: "disk full".to_string(),
        };
        assert!(err.to_string().contains("/var/lib/store/things.json"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let store_err: StoreError = io_err.into();

        match store_err {
            StoreError::Io { kind, .. } => assert_eq!(kind, std::io::ErrorKind::NotFound),
            _ => panic!("Expected Io error"),
        }
    }
}
