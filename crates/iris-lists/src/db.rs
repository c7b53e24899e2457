use std::marker::PhantomData;
use std::path::Path;
use std::sync::Mutex;

use iris_core::config::DatabaseConfig;
use rusqlite::{params, Connection};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{instrument, warn};

use crate::error::{StoreError, StoreResult};
use crate::store::{ListKey, ListStore};

/// Initialise the list entries table.
///
/// Safe to call on every startup; uses `IF NOT EXISTS`.
pub fn init_db(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS list_entries (
            list        TEXT NOT NULL,
            key         TEXT NOT NULL,
            value       TEXT NOT NULL,
            updated_at  TEXT NOT NULL,
            PRIMARY KEY (list, key)
        ) STRICT;",
    )?;
    Ok(())
}

/// Open the configured database, creating its directory and schema if needed.
pub fn open(config: &DatabaseConfig) -> StoreResult<Connection> {
    let path = Path::new(&config.path);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| StoreError::Backend(format!("create {}: {e}", parent.display())))?;
    }
    let conn = Connection::open(path)?;
    init_db(&conn)?;
    Ok(conn)
}

/// Persist hook storing one list's entries as JSON rows in `list_entries`.
pub struct SqliteStore<K, V> {
    list: String,
    db: Mutex<Connection>,
    _entry: PhantomData<fn() -> (K, V)>,
}

impl<K: ListKey, V> SqliteStore<K, V> {
    /// Wrap an already-open connection; the schema is initialised here.
    pub fn new(conn: Connection, list: impl Into<String>) -> StoreResult<Self> {
        init_db(&conn)?;
        Ok(Self {
            list: list.into(),
            db: Mutex::new(conn),
            _entry: PhantomData,
        })
    }

    pub fn list(&self) -> &str {
        &self.list
    }

    fn not_found(&self, key: &K) -> StoreError {
        StoreError::NotFound {
            list: self.list.clone(),
            key: key.to_store_key(),
        }
    }
}

impl<K, V> ListStore<K, V> for SqliteStore<K, V>
where
    K: ListKey,
    V: Serialize + DeserializeOwned,
{
    #[instrument(skip(self, key, value), fields(list = %self.list, key = %key))]
    fn create(&self, key: &K, value: &V) -> StoreResult<()> {
        let json = serde_json::to_string(value)?;
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().expect("list store poisoned");
        db.execute(
            "INSERT INTO list_entries (list, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![self.list, key.to_store_key(), json, now],
        )?;
        Ok(())
    }

    #[instrument(skip(self, key, value), fields(list = %self.list, key = %key))]
    fn update(&self, key: &K, value: &V) -> StoreResult<()> {
        let json = serde_json::to_string(value)?;
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().expect("list store poisoned");
        let changed = db.execute(
            "UPDATE list_entries SET value = ?1, updated_at = ?2 WHERE list = ?3 AND key = ?4",
            params![json, now, self.list, key.to_store_key()],
        )?;
        if changed == 0 {
            return Err(self.not_found(key));
        }
        Ok(())
    }

    #[instrument(skip(self, key), fields(list = %self.list, key = %key))]
    fn delete(&self, key: &K) -> StoreResult<()> {
        let db = self.db.lock().expect("list store poisoned");
        let changed = db.execute(
            "DELETE FROM list_entries WHERE list = ?1 AND key = ?2",
            params![self.list, key.to_store_key()],
        )?;
        if changed == 0 {
            return Err(self.not_found(key));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(list = %self.list))]
    fn load(&self) -> StoreResult<Vec<(K, V)>> {
        let db = self.db.lock().expect("list store poisoned");
        let mut stmt = db.prepare("SELECT key, value FROM list_entries WHERE list = ?1")?;
        let rows = stmt.query_map(params![self.list], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            let (raw, json) = row?;
            match K::from_store_key(&raw) {
                Some(key) => entries.push((key, serde_json::from_str(&json)?)),
                None => warn!(list = %self.list, key = %raw, "skipping row with unparseable key"),
            }
        }
        Ok(entries)
    }
}
