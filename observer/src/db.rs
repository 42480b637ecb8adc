use std::{collections::HashMap, fs, path::Path};

use anyhow::{Context, Result, anyhow};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};

use crate::bridge::KeyValueStore;

/// A [KeyValueStore] backed by a single SQLite table.
#[derive(Debug)]
pub struct SqliteStore {
    // `None` once closed.
    connection: Mutex<Option<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the store at `data_dir/observer.sqlite3`.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir).context(format!("Unable to create {data_dir:?}"))?;
        let connection = Connection::open(data_dir.join("observer.sqlite3"))?;
        connection.trace_v2(
            rusqlite::trace::TraceEventCodes::SQLITE_TRACE_STMT,
            Some(|statement| {
                if let rusqlite::trace::TraceEvent::Stmt(_, statement) = statement {
                    tracing::trace!(statement, "sql executed");
                }
            }),
        );
        connection.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key BLOB NOT NULL PRIMARY KEY,
                value BLOB NOT NULL
            );",
        )?;
        Ok(SqliteStore {
            connection: Mutex::new(Some(connection)),
        })
    }

    fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let connection = self.connection.lock();
        let connection = connection
            .as_ref()
            .ok_or_else(|| anyhow!("store is closed"))?;
        Ok(f(connection)?)
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.with_connection(|c| {
            c.query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| row.get(0))
                .optional()
        })
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.with_connection(|c| {
            c.execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT (key) DO UPDATE SET value = excluded.value",
                [key, value],
            )
        })?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if let Some(connection) = self.connection.lock().take() {
            connection.close().map_err(|(_, e)| e)?;
        }
        Ok(())
    }
}

/// A [KeyValueStore] that forgets everything on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.values.lock().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}
