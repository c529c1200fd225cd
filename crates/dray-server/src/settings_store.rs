/// Durable key/value store for UI-editable application settings.
///
/// Lives in the job-history database file (its own table and connection)
/// and is not on the scheduler hot path. Keys are scoped strings
/// ("app.name", "maintenance.enabled"); values are opaque JSON.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

pub struct SettingsStore {
    conn: Mutex<Connection>,
}

impl SettingsStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn get(&self, key: &str) -> rusqlite::Result<Option<serde_json::Value>> {
        let conn = self.conn.lock().expect("settings db poisoned");
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(blob.and_then(|b| serde_json::from_slice(&b).ok()))
    }

    pub fn put(&self, key: &str, value: &serde_json::Value, now_ms: u64) -> rusqlite::Result<()> {
        let conn = self.conn.lock().expect("settings db poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value.to_string().into_bytes(), now_ms],
        )?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> rusqlite::Result<bool> {
        let conn = self.conn.lock().expect("settings db poisoned");
        let n = conn.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(n > 0)
    }

    pub fn list(&self) -> rusqlite::Result<BTreeMap<String, serde_json::Value>> {
        let conn = self.conn.lock().expect("settings db poisoned");
        let mut stmt = conn.prepare("SELECT key, value FROM settings ORDER BY key")?;
        let rows = stmt.query_map([], |row| {
            let key: String = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            Ok((key, blob))
        })?;
        let mut out = BTreeMap::new();
        for row in rows {
            let (key, blob) = row?;
            out.insert(
                key,
                serde_json::from_slice(&blob).unwrap_or(serde_json::Value::Null),
            );
        }
        Ok(out)
    }
}
