//! e2e_kvstore - end-to-end encryption session store.
//!
//! Persists pairwise sessions, group sessions, room encryption settings and
//! account identity material on a synchronous key-value substrate, emulating
//! typed lookups with key-prefix conventions.

mod host_storage;
#[cfg(not(target_arch = "wasm32"))]
mod sqlite_storage;
mod storage;
mod utils;

pub mod api;
pub mod namespace;

pub use api::config::StoreConfig;
pub use api::store::{CryptoSessionStore, SESSION_BATCH_SIZE, StoreError, StoreResult};
pub use host_storage::HostStorage;
#[cfg(not(target_arch = "wasm32"))]
pub use sqlite_storage::SqliteStorage;
pub use storage::{KeyValueStorage, MemoryStorage, StorageError};
pub use utils::current_time;
