//! KeyValueStorage — the synchronous substrate the crypto store is built on.
//!
//! The contract is deliberately minimal: point reads and writes plus
//! `len`/`key_at` enumeration. There are no transactions, no range queries
//! and no secondary indexes. Every "query" the store needs is a prefix scan,
//! which the default [`KeyValueStorage::keys_with_prefix`] performs linearly;
//! ordered backends override it with a range iteration.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use zeroize::Zeroize;

// ═══════════════════════════════════════════════════════════════
// ERROR TYPE
// ═══════════════════════════════════════════════════════════════

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("Failed to open storage: {0}")]
    Open(String),
    #[error("Encryption key rejected: {0}")]
    Encryption(String),
    #[error("Schema migration failed: {0}")]
    Migration(String),
    #[error("Storage schema version {found} is newer than supported {supported}")]
    SchemaTooNew { found: u32, supported: u32 },
    #[error("Storage backend error: {0}")]
    Backend(String),
}

// ═══════════════════════════════════════════════════════════════
// SUBSTRATE TRAIT
// ═══════════════════════════════════════════════════════════════

pub trait KeyValueStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Remove `key`. Removing an absent key is a no-op.
    fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// Number of keys currently stored.
    fn len(&self) -> Result<usize, StorageError>;

    /// The key at position `index` of the enumeration order, if any.
    fn key_at(&self, index: usize) -> Result<Option<String>, StorageError>;

    fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    /// Snapshot of every key starting with `prefix`, in enumeration order.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        for index in 0..self.len()? {
            if let Some(key) = self.key_at(index)? {
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }
}

/// Smallest string sorting after every string that starts with `prefix`.
///
/// `None` when no such bound exists (empty prefix, or a last character that
/// cannot be incremented); callers then scan to the end of the key space.
pub(crate) fn prefix_upper_bound(prefix: &str) -> Option<String> {
    let mut bound = prefix.to_owned();
    let last = bound.pop()?;
    let next = char::from_u32(last as u32 + 1)?;
    bound.push(next);
    Some(bound)
}

// ═══════════════════════════════════════════════════════════════
// MEMORY STORAGE
// ═══════════════════════════════════════════════════════════════

/// Ordered in-memory substrate.
///
/// Keys enumerate in lexicographic order, so prefix scans are range
/// iterations. Values hold pickled key material and are zeroized when they
/// are overwritten, removed, or when the storage is dropped.
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a storage pre-populated with `entries`.
    pub fn from_entries(entries: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            entries: RwLock::new(entries.into_iter().collect()),
        }
    }

    /// Copy of every stored entry, in key order.
    pub fn entries(&self) -> Vec<(String, String)> {
        self.entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl Drop for MemoryStorage {
    fn drop(&mut self) {
        for (_k, mut v) in std::mem::take(self.entries.get_mut()) {
            v.zeroize();
        }
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        if let Some(mut old) = self.entries.write().insert(key.to_owned(), value.to_owned()) {
            old.zeroize();
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        if let Some(mut old) = self.entries.write().remove(key) {
            old.zeroize();
        }
        Ok(())
    }

    fn len(&self) -> Result<usize, StorageError> {
        Ok(self.entries.read().len())
    }

    fn key_at(&self, index: usize) -> Result<Option<String>, StorageError> {
        Ok(self.entries.read().keys().nth(index).cloned())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let entries = self.entries.read();
        Ok(entries
            .range(prefix.to_owned()..)
            .map(|(k, _)| k)
            .take_while(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Substrate that only implements the required methods, to exercise the
    /// default linear prefix scan.
    struct UnorderedStorage(RwLock<Vec<(String, String)>>);

    impl KeyValueStorage for UnorderedStorage {
        fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
            Ok(self.0.read().iter().find(|(k, _)| k == key).map(|(_, v)| v.clone()))
        }

        fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
            let mut entries = self.0.write();
            match entries.iter_mut().find(|(k, _)| k == key) {
                Some(entry) => entry.1 = value.to_owned(),
                None => entries.push((key.to_owned(), value.to_owned())),
            }
            Ok(())
        }

        fn remove(&self, key: &str) -> Result<(), StorageError> {
            self.0.write().retain(|(k, _)| k != key);
            Ok(())
        }

        fn len(&self) -> Result<usize, StorageError> {
            Ok(self.0.read().len())
        }

        fn key_at(&self, index: usize) -> Result<Option<String>, StorageError> {
            Ok(self.0.read().get(index).map(|(k, _)| k.clone()))
        }
    }

    #[test]
    fn linear_scan_keeps_enumeration_order() {
        let storage = UnorderedStorage(RwLock::new(Vec::new()));
        storage.set("crypto.rooms/b", "1").unwrap();
        storage.set("other", "2").unwrap();
        storage.set("crypto.rooms/a", "3").unwrap();
        assert_eq!(
            storage.keys_with_prefix("crypto.rooms/").unwrap(),
            vec!["crypto.rooms/b".to_string(), "crypto.rooms/a".to_string()]
        );
    }

    #[test]
    fn memory_range_scan_stops_at_prefix_end() {
        let storage = MemoryStorage::from_entries([
            ("crypto.sessions/a".to_string(), "{}".to_string()),
            ("crypto.sessions/b".to_string(), "{}".to_string()),
            ("crypto.sessionsneedingbackup".to_string(), "{}".to_string()),
            ("crypto.rooms/x".to_string(), "{}".to_string()),
        ]);
        assert_eq!(
            storage.keys_with_prefix("crypto.sessions/").unwrap(),
            vec!["crypto.sessions/a".to_string(), "crypto.sessions/b".to_string()]
        );
        assert!(storage.keys_with_prefix("crypto.zzz").unwrap().is_empty());
    }

    #[test]
    fn memory_enumeration_is_sorted() {
        let storage = MemoryStorage::new();
        storage.set("b", "2").unwrap();
        storage.set("a", "1").unwrap();
        assert_eq!(storage.len().unwrap(), 2);
        assert_eq!(storage.key_at(0).unwrap().as_deref(), Some("a"));
        assert_eq!(storage.key_at(1).unwrap().as_deref(), Some("b"));
        assert_eq!(storage.key_at(2).unwrap(), None);
    }

    #[test]
    fn remove_absent_key_is_noop() {
        let storage = MemoryStorage::new();
        storage.remove("missing").unwrap();
        assert!(storage.is_empty().unwrap());
    }

    #[test]
    fn upper_bound_increments_last_char() {
        assert_eq!(prefix_upper_bound("crypto.rooms/").as_deref(), Some("crypto.rooms0"));
        assert_eq!(prefix_upper_bound(""), None);
    }
}
