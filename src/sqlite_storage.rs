//! SqliteStorage — encrypted, persistent key-value substrate.
//!
//! SQLCipher via rusqlite (AES-256 transparent encryption). Keys are kept
//! in primary-key order, so prefix scans are index range lookups.
//!
//! Schema:
//! ```sql
//! CREATE TABLE crypto_kv (key TEXT PRIMARY KEY, value TEXT NOT NULL) WITHOUT ROWID;
//! CREATE TABLE db_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL);
//! ```

use parking_lot::Mutex;
use rusqlite::OptionalExtension;
use zeroize::Zeroize;

use crate::storage::{prefix_upper_bound, KeyValueStorage, StorageError};

/// Current database schema version.
///
/// Bump when the table layout or value encoding changes, and add the
/// matching step to `run_migrations`.
pub(crate) const LATEST_SCHEMA_VERSION: u32 = 1;

/// Key in the `db_meta` table that stores the schema version.
const META_SCHEMA_VERSION: &str = "schema_version";

pub struct SqliteStorage {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteStorage {
    /// Open or create an encrypted database.
    ///
    /// - `db_path`: File path, or `":memory:"` for an ephemeral database.
    /// - `encryption_key`: 32-byte AES-256 key for SQLCipher. The encoded
    ///   copies made here are zeroized; the caller owns `encryption_key`.
    pub fn open(db_path: &str, encryption_key: &[u8]) -> Result<Self, StorageError> {
        if encryption_key.len() != 32 {
            return Err(StorageError::Encryption(format!(
                "encryption_key must be 32 bytes, got {}",
                encryption_key.len()
            )));
        }

        let conn = rusqlite::Connection::open(db_path)
            .map_err(|e| StorageError::Open(e.to_string()))?;

        // SQLCipher takes the raw key as a hex blob literal.
        let mut hex_key = hex_string(encryption_key);
        let mut pragma = format!("x'{hex_key}'");
        hex_key.zeroize();
        let keyed = conn.pragma_update(None, "key", &pragma);
        pragma.zeroize();
        keyed.map_err(|e| StorageError::Encryption(format!("Failed to set encryption key: {e}")))?;

        // A wrong key only surfaces on the first read.
        conn.execute_batch("SELECT count(*) FROM sqlite_master;")
            .map_err(|e| {
                StorageError::Encryption(format!("Key verification failed (wrong key?): {e}"))
            })?;

        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.run_migrations()?;
        log::info!("Opened crypto store database at {db_path}");
        Ok(storage)
    }

    fn run_migrations(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS db_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL);",
        )
        .map_err(|e| StorageError::Migration(format!("Failed to create db_meta table: {e}")))?;

        let version: u32 = conn
            .query_row(
                "SELECT COALESCE((SELECT CAST(value AS INTEGER) FROM db_meta WHERE key = ?1), 0)",
                rusqlite::params![META_SCHEMA_VERSION],
                |row| row.get(0),
            )
            .map_err(|e| StorageError::Migration(format!("Failed to read schema version: {e}")))?;

        if version > LATEST_SCHEMA_VERSION {
            return Err(StorageError::SchemaTooNew {
                found: version,
                supported: LATEST_SCHEMA_VERSION,
            });
        }

        if version < 1 {
            Self::migrate_v0_to_v1(&conn)?;
            log::info!("Migrated crypto store schema v0 -> v1");
        }

        Ok(())
    }

    /// v0 → v1: Create the `crypto_kv` table.
    fn migrate_v0_to_v1(conn: &rusqlite::Connection) -> Result<(), StorageError> {
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| StorageError::Migration(format!("v0->v1: failed to begin transaction: {e}")))?;
        tx.execute_batch(
            "CREATE TABLE IF NOT EXISTS crypto_kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            ) WITHOUT ROWID;",
        )
        .map_err(|e| StorageError::Migration(format!("v0->v1 failed: {e}")))?;
        tx.execute(
            "INSERT OR REPLACE INTO db_meta (key, value) VALUES (?1, '1')",
            rusqlite::params![META_SCHEMA_VERSION],
        )
        .map_err(|e| StorageError::Migration(format!("v0->v1: failed to write version: {e}")))?;
        tx.commit()
            .map_err(|e| StorageError::Migration(format!("v0->v1: commit failed: {e}")))?;
        Ok(())
    }

    /// Schema version recorded in the database.
    pub fn schema_version(&self) -> Result<u32, StorageError> {
        self.conn
            .lock()
            .query_row(
                "SELECT CAST(value AS INTEGER) FROM db_meta WHERE key = ?1",
                rusqlite::params![META_SCHEMA_VERSION],
                |row| row.get(0),
            )
            .map_err(backend)
    }
}

fn backend(e: rusqlite::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl KeyValueStorage for SqliteStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.conn
            .lock()
            .query_row(
                "SELECT value FROM crypto_kv WHERE key = ?1",
                rusqlite::params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO crypto_kv (key, value) VALUES (?1, ?2)",
                rusqlite::params![key, value],
            )
            .map_err(backend)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.conn
            .lock()
            .execute("DELETE FROM crypto_kv WHERE key = ?1", rusqlite::params![key])
            .map_err(backend)?;
        Ok(())
    }

    fn len(&self) -> Result<usize, StorageError> {
        let count: i64 = self
            .conn
            .lock()
            .query_row("SELECT count(*) FROM crypto_kv", [], |row| row.get(0))
            .map_err(backend)?;
        Ok(count as usize)
    }

    fn key_at(&self, index: usize) -> Result<Option<String>, StorageError> {
        self.conn
            .lock()
            .query_row(
                "SELECT key FROM crypto_kv ORDER BY key LIMIT 1 OFFSET ?1",
                rusqlite::params![index as i64],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let conn = self.conn.lock();
        let mut keys = Vec::new();
        match prefix_upper_bound(prefix) {
            Some(upper) => {
                let mut stmt = conn
                    .prepare("SELECT key FROM crypto_kv WHERE key >= ?1 AND key < ?2 ORDER BY key")
                    .map_err(backend)?;
                let rows = stmt
                    .query_map(rusqlite::params![prefix, upper], |row| row.get::<_, String>(0))
                    .map_err(backend)?;
                for row in rows {
                    keys.push(row.map_err(backend)?);
                }
            }
            None => {
                let mut stmt = conn
                    .prepare("SELECT key FROM crypto_kv WHERE key >= ?1 ORDER BY key")
                    .map_err(backend)?;
                let rows = stmt
                    .query_map(rusqlite::params![prefix], |row| row.get::<_, String>(0))
                    .map_err(backend)?;
                for row in rows {
                    keys.push(row.map_err(backend)?);
                }
            }
        }
        // The range is a superset only if the bound could not be computed.
        keys.retain(|k| k.starts_with(prefix));
        Ok(keys)
    }
}
