//! HostStorage — substrate backed by host-supplied synchronous callbacks.
//!
//! Five callbacks mirror the host's key-value namespace (for example a
//! browser `localStorage` reached through a bridge):
//! - `get(key) -> Option<value>`
//! - `set(key, value)`
//! - `remove(key)`
//! - `len() -> count`
//! - `key_at(index) -> Option<key>`
//!
//! The host namespace is assumed always available, so every operation is
//! infallible from the store's point of view.

use crate::storage::{KeyValueStorage, StorageError};

type GetFn = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;
type SetFn = Box<dyn Fn(&str, &str) + Send + Sync>;
type RemoveFn = Box<dyn Fn(&str) + Send + Sync>;
type LenFn = Box<dyn Fn() -> usize + Send + Sync>;
type KeyAtFn = Box<dyn Fn(usize) -> Option<String> + Send + Sync>;

pub struct HostStorage {
    get_fn: GetFn,
    set_fn: SetFn,
    remove_fn: RemoveFn,
    len_fn: LenFn,
    key_at_fn: KeyAtFn,
}

impl HostStorage {
    pub fn new(
        get_fn: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
        set_fn: impl Fn(&str, &str) + Send + Sync + 'static,
        remove_fn: impl Fn(&str) + Send + Sync + 'static,
        len_fn: impl Fn() -> usize + Send + Sync + 'static,
        key_at_fn: impl Fn(usize) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            get_fn: Box::new(get_fn),
            set_fn: Box::new(set_fn),
            remove_fn: Box::new(remove_fn),
            len_fn: Box::new(len_fn),
            key_at_fn: Box::new(key_at_fn),
        }
    }
}

impl KeyValueStorage for HostStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok((self.get_fn)(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        (self.set_fn)(key, value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        (self.remove_fn)(key);
        Ok(())
    }

    fn len(&self) -> Result<usize, StorageError> {
        Ok((self.len_fn)())
    }

    fn key_at(&self, index: usize) -> Result<Option<String>, StorageError> {
        Ok((self.key_at_fn)(index))
    }
}

