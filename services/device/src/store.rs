use hl_schema::Schema;
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use thiserror::Error;

const SCHEMA_SQL: &str = include_str!("storage/schema.sql");

/// Key under which the last-known-good schema is persisted.
pub const LAST_SCHEMA_KEY: &str = "lastSchema";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Integrity: {0}")]
    IntegrityCheckFailed(String),
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt cached value: {0}")]
    Corrupt(String),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("write rejected")]
    WriteRejected,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Opaque byte-level key/value persistence.
///
/// The session controller and pipeline only ever need `get`/`put`, which
/// keeps persistence substitutable with an in-memory map in tests.
pub trait SchemaStore: Send + Sync {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;
    fn put(&self, key: &str, value: &[u8]) -> StoreResult<()>;
}

/// Persist a schema as canonical JSON under [`LAST_SCHEMA_KEY`].
pub fn save_schema(store: &dyn SchemaStore, schema: &Schema) -> StoreResult<()> {
    store.put(LAST_SCHEMA_KEY, hl_schema::canonical_json(schema).as_bytes())
}

/// Load the previously persisted schema, if any.
pub fn load_cached_schema(store: &dyn SchemaStore) -> StoreResult<Option<Schema>> {
    match store.get(LAST_SCHEMA_KEY)? {
        None => Ok(None),
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Corrupt(e.to_string())),
    }
}

// ---------------------------------------------------------------------------
// SQLite store
// ---------------------------------------------------------------------------

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.apply_pragmas()?;
        store.apply_schema()?;
        store.integrity_check()?;
        Ok(store)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.apply_pragmas()?;
        store.apply_schema()?;
        Ok(store)
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn apply_pragmas(&self) -> StoreResult<()> {
        self.lock()?.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL; PRAGMA foreign_keys=ON;",
        )?;
        Ok(())
    }

    fn apply_schema(&self) -> StoreResult<()> {
        self.lock()?.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    pub fn integrity_check(&self) -> StoreResult<()> {
        let result: String =
            self.lock()?
                .pragma_query_value(None, "integrity_check", |row| row.get(0))?;
        if result != "ok" {
            return Err(StoreError::IntegrityCheckFailed(result));
        }
        Ok(())
    }
}

impl SchemaStore for SqliteStore {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT value FROM kv WHERE key = ?1")?;
        let mut rows = stmt.query_map([key], |row| row.get::<_, Vec<u8>>(0))?;
        Ok(rows.next().transpose()?)
    }

    fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.lock()?.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            rusqlite::params![key, value],
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory store (tests and ephemeral embedders)
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<HashMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put` fail, to exercise best-effort persistence.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl SchemaStore for MemoryStore {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let inner = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        Ok(inner.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::WriteRejected);
        }
        let mut inner = self.inner.write().map_err(|_| StoreError::Poisoned)?;
        inner.insert(key.to_owned(), value.to_vec());
        Ok(())
    }
}
