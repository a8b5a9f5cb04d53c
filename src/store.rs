// src/store.rs
//
// SQLite-backed record store.
// One row per record: device name, capture time, then one TEXT column per
// schema column. Every session inserts through the same sink.

use chrono::{DateTime, Utc};
use rusqlite::{params_from_iter, types::Value, Connection};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

use crate::identity::DeviceIdentity;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open database {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to prepare table: {0}")]
    Schema(#[source] rusqlite::Error),
    #[error("insert failed: {0}")]
    Insert(#[source] rusqlite::Error),
    #[error("table {table} exists without columns {missing:?}; point database_path or table elsewhere")]
    MissingColumns { table: String, missing: Vec<String> },
    #[error("store used before its schema was set")]
    NoSchema,
    #[error("record has {found} values, table has {expected} data columns")]
    ValueCount { expected: usize, found: usize },
}

/// A validated frame stamped with its device and capture time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub device: DeviceIdentity,
    /// One entry per schema column; `None` is stored as NULL
    pub values: Vec<Option<String>>,
    pub captured_at: DateTime<Utc>,
}

/// Where records go. Shared by every session, so implementations
/// serialise their own writes.
pub trait PersistenceSink: Send + Sync {
    /// Create (or extend) the record table for these columns
    fn ensure_schema(&self, columns: &[String]) -> Result<(), StoreError>;

    fn insert(&self, record: &Record) -> Result<(), StoreError>;
}

/// SQLite timestamps, as `datetime('now')` writes them plus milliseconds
pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

struct Prepared {
    sql: String,
    columns: Vec<String>,
}

pub struct SqliteSink {
    // rusqlite::Connection is !Sync, so Mutex (not RwLock)
    conn: Mutex<Connection>,
    table: String,
    insert: Mutex<Option<Prepared>>,
}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SqliteSink {
    pub fn open(path: &Path, table: &str) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            // Connection::open reports a missing directory poorly
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path).map_err(|source| StoreError::Open {
            path: path.to_path_buf(),
            source,
        })?;

        // WAL mode for concurrent readers while sessions write
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|source| StoreError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        // Synchronous NORMAL is safe with WAL and faster than FULL
        conn.execute_batch("PRAGMA synchronous=NORMAL;")
            .map_err(|source| StoreError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        tlog!("[store] Opened {} (table {})", path.display(), table);
        Ok(Self::with_connection(conn, table))
    }

    pub fn open_in_memory(table: &str) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|source| StoreError::Open {
            path: PathBuf::from(":memory:"),
            source,
        })?;
        Ok(Self::with_connection(conn, table))
    }

    fn with_connection(conn: Connection, table: &str) -> Self {
        SqliteSink {
            conn: Mutex::new(conn),
            table: table.to_string(),
            insert: Mutex::new(None),
        }
    }

    /// Row count, optionally for one device
    pub fn count_records(&self, device: Option<&str>) -> Result<usize, StoreError> {
        let conn = relock(&self.conn);
        let table = quote_ident(&self.table);
        let count: i64 = match device {
            Some(name) => conn.query_row(
                &format!("SELECT COUNT(*) FROM {} WHERE device_name = ?1", table),
                [name],
                |row| row.get(0),
            ),
            None => conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                row.get(0)
            }),
        }
        .map_err(StoreError::Schema)?;
        Ok(count as usize)
    }

    /// All data values in insertion order, for one device
    pub fn device_rows(&self, device: &str) -> Result<Vec<Vec<Option<String>>>, StoreError> {
        let columns = match relock(&self.insert).as_ref() {
            Some(prepared) => prepared.columns.clone(),
            None => return Err(StoreError::NoSchema),
        };
        let names: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
        let conn = relock(&self.conn);
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM {} WHERE device_name = ?1 ORDER BY id",
                names.join(", "),
                quote_ident(&self.table)
            ))
            .map_err(StoreError::Schema)?;
        let rows = stmt
            .query_map([device], |row| {
                (0..columns.len())
                    .map(|i| row.get::<_, Option<String>>(i))
                    .collect::<rusqlite::Result<Vec<_>>>()
            })
            .map_err(StoreError::Schema)?;
        let values = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::Schema)?;
        Ok(values)
    }

    fn existing_columns(conn: &Connection, table: &str) -> rusqlite::Result<Vec<String>> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>("name"))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names)
    }
}

impl PersistenceSink for SqliteSink {
    fn ensure_schema(&self, columns: &[String]) -> Result<(), StoreError> {
        let conn = relock(&self.conn);
        let table = quote_ident(&self.table);

        let mut sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             id INTEGER PRIMARY KEY AUTOINCREMENT, \
             device_name TEXT NOT NULL, \
             timestamp TEXT NOT NULL",
            table
        );
        for column in columns {
            sql.push_str(&format!(", {} TEXT", quote_ident(column)));
        }
        sql.push_str(");");
        conn.execute_batch(&sql).map_err(StoreError::Schema)?;

        // Tables are never altered; one left by a different schema file is refused
        let existing = Self::existing_columns(&conn, &self.table).map_err(StoreError::Schema)?;
        let missing: Vec<String> = columns
            .iter()
            .filter(|column| !existing.iter().any(|e| e.eq_ignore_ascii_case(column)))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(StoreError::MissingColumns {
                table: self.table.clone(),
                missing,
            });
        }

        let names: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
        let placeholders: Vec<String> = (0..columns.len() + 2).map(|i| format!("?{}", i + 1)).collect();
        let insert_sql = format!(
            "INSERT INTO {} (device_name, timestamp, {}) VALUES ({})",
            table,
            names.join(", "),
            placeholders.join(", ")
        );
        *relock(&self.insert) = Some(Prepared {
            sql: insert_sql,
            columns: columns.to_vec(),
        });

        tlog!("[store] Table {} ready with {} data columns", self.table, columns.len());
        Ok(())
    }

    fn insert(&self, record: &Record) -> Result<(), StoreError> {
        let sql = {
            let guard = relock(&self.insert);
            let prepared = guard.as_ref().ok_or(StoreError::NoSchema)?;
            if prepared.columns.len() != record.values.len() {
                return Err(StoreError::ValueCount {
                    expected: prepared.columns.len(),
                    found: record.values.len(),
                });
            }
            prepared.sql.clone()
        };

        let mut params: Vec<Value> = Vec::with_capacity(record.values.len() + 2);
        params.push(Value::Text(record.device.name().to_string()));
        params.push(Value::Text(format_timestamp(&record.captured_at)));
        params.extend(record.values.iter().map(|v| match v {
            Some(text) => Value::Text(text.clone()),
            None => Value::Null,
        }));

        let conn = relock(&self.conn);
        let mut stmt = conn.prepare_cached(&sql).map_err(StoreError::Insert)?;
        stmt.execute(params_from_iter(params))
            .map_err(StoreError::Insert)?;
        Ok(())
    }
}
