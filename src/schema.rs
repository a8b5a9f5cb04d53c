// src/schema.rs
//
// Record schema: the ordered column names every frame is matched against.
// Loaded once at startup, then shared read-only by every session.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use crate::error::SchemaError;

/// Ordered, immutable list of column names. Cloning is cheap.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Schema {
    columns: Arc<[String]>,
}

impl Schema {
    /// Build a schema from column names. Blank names are skipped,
    /// surrounding whitespace is trimmed, duplicates are rejected.
    pub fn new<I, S>(columns: I) -> Result<Self, SchemaError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for column in columns {
            let name = column.as_ref().trim();
            if name.is_empty() {
                continue;
            }
            // SQLite column names are case-insensitive
            if !seen.insert(name.to_ascii_lowercase()) {
                return Err(SchemaError::DuplicateColumn(name.to_string()));
            }
            out.push(name.to_string());
        }
        Ok(Schema {
            columns: out.into(),
        })
    }

    /// Load a newline-delimited column file. A missing or empty file is fatal.
    pub fn load(path: &Path) -> Result<Self, SchemaError> {
        let content = std::fs::read_to_string(path).map_err(|source| SchemaError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let schema = Schema::new(content.lines())?;
        if schema.is_empty() {
            return Err(SchemaError::Empty(path.to_path_buf()));
        }
        Ok(schema)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Number of fields in a complete record.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_skips_blank_lines_and_trims() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "BoxID\r\n  Time \n\nExt_Temp\n").unwrap();

        let schema = Schema::load(file.path()).unwrap();
        assert_eq!(schema.columns(), &["BoxID", "Time", "Ext_Temp"]);
        assert_eq!(schema.len(), 3);
    }

    #[test]
    fn test_load_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Schema::load(&dir.path().join("headers.txt")).unwrap_err();
        assert!(matches!(err, SchemaError::Read { .. }));
    }

    #[test]
    fn test_load_empty_file_is_error() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = Schema::load(file.path()).unwrap_err();
        assert!(matches!(err, SchemaError::Empty(_)));
    }

    #[test]
    fn test_duplicate_columns_rejected() {
        let err = Schema::new(["temp", "humidity", "TEMP"]).unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateColumn(ref c) if c == "TEMP"));
    }

    #[test]
    fn test_clone_shares_columns() {
        let schema = Schema::new(["a", "b"]).unwrap();
        let other = schema.clone();
        assert!(Arc::ptr_eq(&schema.columns, &other.columns));
    }
}
