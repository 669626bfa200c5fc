//! Configuration for opening a persistent crypto store.

use zeroize::{Zeroize, ZeroizeOnDrop};

/// Where and how to open the database behind a persistent store.
///
/// The encryption key is wiped from memory when the config is dropped.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct StoreConfig {
    /// File path of the SQLCipher database, or `":memory:"` for an ephemeral
    /// one (useful for tests).
    #[zeroize(skip)]
    pub db_path: String,
    /// 32-byte AES-256 key protecting data at rest. Generating and keeping
    /// this key (e.g. in platform secure storage) is the caller's job.
    pub encryption_key: Vec<u8>,
}

impl StoreConfig {
    pub fn new(db_path: impl Into<String>, encryption_key: Vec<u8>) -> Self {
        Self {
            db_path: db_path.into(),
            encryption_key,
        }
    }

    /// Ephemeral in-memory database with the given key.
    pub fn in_memory(encryption_key: Vec<u8>) -> Self {
        Self::new(":memory:", encryption_key)
    }
}
