// src/error.rs
//
// Error taxonomy for the ingestion path.
// Link and store errors stay local to one session or one record; the
// variants of IngestError are the ones that end the process.

use std::path::PathBuf;

use thiserror::Error;

pub use crate::io::hotplug::WatchError;
pub use crate::io::serial::link::LinkError;
pub use crate::store::StoreError;

/// Schema file could not be turned into a column list.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to read schema file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("schema file {0} contains no column names")]
    Empty(PathBuf),
    #[error("schema column '{0}' appears more than once")]
    DuplicateColumn(String),
}

/// Settings file or CLI overrides are unusable.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl SettingsError {
    pub(crate) fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        SettingsError::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Fatal-to-process failures. Anything here stops ingestion entirely.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("record store unavailable: {0}")]
    Store(#[from] StoreError),
    #[error("device watcher failed: {0}")]
    Watch(#[from] WatchError),
}
