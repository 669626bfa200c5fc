//! CryptoSessionStore — crypto session state on a flat key-value substrate.
//!
//! Every entity is a JSON value under a key from [`crate::namespace`].
//! Lookups by entity type or foreign key are prefix scans; there is no other
//! index. Operations are `async` to match the other crypto store backends,
//! but none of them ever suspends.
//!
//! Reads are forgiving: a value that fails to decode is logged and treated
//! as absent. Only substrate failures are returned as errors.
//!
//! There is no locking and no cross-call atomicity. Read-modify-write
//! operations (`store_session`, `mark_sessions_needing_backup`, ...) are
//! last-writer-wins; callers sharing a substrate must serialize writers.

use std::collections::BTreeMap;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::types::{
    decode_device_sessions, parse_device_sessions, BackupFlagIndex, CrossSigningKeys, ErrorDevice, GroupSessionId,
    GroupSessionRecord, InboundGroupSessionData, MigrationState, OlmSessionId, RoomEncryption,
    RawDeviceSessions, SessionInfo, SessionProblem, SessionRecord, Transaction, TransactionMode,
    WithheldRecord,
};
use crate::namespace::{
    self, E2E_PREFIX, INBOUND_GROUP_SESSION_PREFIX, KEY_ACCOUNT, KEY_CROSS_SIGNING_KEYS,
    KEY_DEVICE_DATA, KEY_MIGRATION_STATE, KEY_NOTIFIED_ERROR_DEVICES,
    KEY_SESSIONS_NEEDING_BACKUP, ROOMS_PREFIX, SESSIONS_PREFIX,
};
use crate::storage::{KeyValueStorage, StorageError};

/// Number of sessions returned by one batch read during migration.
///
/// Migration checkpoints are counted in batches, so this value must match
/// the other store implementations.
pub const SESSION_BATCH_SIZE: usize = 50;

// ═══════════════════════════════════════════════════════════════
// ERROR TYPE
// ═══════════════════════════════════════════════════════════════

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ═══════════════════════════════════════════════════════════════
// CRYPTO SESSION STORE
// ═══════════════════════════════════════════════════════════════

pub struct CryptoSessionStore<S> {
    storage: S,
}

#[cfg(not(target_arch = "wasm32"))]
impl CryptoSessionStore<crate::sqlite_storage::SqliteStorage> {
    /// Open (or create) a store backed by an encrypted SQLite database.
    pub fn open(config: &super::config::StoreConfig) -> StoreResult<Self> {
        let storage =
            crate::sqlite_storage::SqliteStorage::open(&config.db_path, &config.encryption_key)?;
        Ok(Self::new(storage))
    }
}

impl<S: KeyValueStorage> CryptoSessionStore<S> {
    // ═══════════════════════════════════════════════════════════
    // CONSTRUCTOR
    // ═══════════════════════════════════════════════════════════

    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    /// The underlying substrate.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Give the substrate back, e.g. to inspect or reuse it after a purge.
    pub fn into_storage(self) -> S {
        self.storage
    }

    /// True if `storage` holds any key of the crypto store's namespace.
    pub fn exists(storage: &S) -> StoreResult<bool> {
        Ok(!storage.keys_with_prefix(E2E_PREFIX)?.is_empty())
    }

    // ═══════════════════════════════════════════════════════════
    // INTERNAL HELPERS
    // ═══════════════════════════════════════════════════════════

    /// Read and decode `key`. Undecodable values read as absent.
    fn read_json<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        let Some(raw) = self.storage.get(key)? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                log::warn!("Ignoring corrupted value under {key}: {e}");
                Ok(None)
            }
        }
    }

    fn write_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> StoreResult<()> {
        let raw =
            serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.storage.set(key, &raw)?;
        Ok(())
    }

    /// Stored session mapping of one device, entries left as written.
    /// A missing or corrupted mapping reads as empty.
    fn read_raw_device_sessions(&self, device_key: &str) -> StoreResult<RawDeviceSessions> {
        let key = namespace::sessions_key(device_key);
        let Some(raw) = self.storage.get(&key)? else {
            return Ok(RawDeviceSessions::new());
        };
        match parse_device_sessions(&raw) {
            Ok(entries) => Ok(entries),
            Err(e) => {
                log::warn!("Ignoring corrupted session mapping under {key}: {e}");
                Ok(RawDeviceSessions::new())
            }
        }
    }

    /// Decoded sessions of one device; undecodable entries are left out.
    fn read_device_sessions(&self, device_key: &str) -> StoreResult<BTreeMap<String, SessionInfo>> {
        Ok(decode_device_sessions(&self.read_raw_device_sessions(device_key)?))
    }

    /// Write a device's mapping back; an empty mapping removes the key.
    fn write_raw_device_sessions(
        &self,
        device_key: &str,
        entries: &RawDeviceSessions,
    ) -> StoreResult<()> {
        let key = namespace::sessions_key(device_key);
        if entries.is_empty() {
            self.storage.remove(&key)?;
            Ok(())
        } else {
            self.write_json(&key, entries)
        }
    }

    fn read_backup_index(&self) -> StoreResult<BackupFlagIndex> {
        Ok(self
            .read_json(KEY_SESSIONS_NEEDING_BACKUP)?
            .unwrap_or_default())
    }

    // ═══════════════════════════════════════════════════════════
    // NAMESPACE
    // ═══════════════════════════════════════════════════════════

    /// True iff any key under the reserved prefix exists.
    pub async fn contains_data(&self) -> StoreResult<bool> {
        Self::exists(&self.storage)
    }

    /// Remove every key of the crypto store's namespace. Keys outside the
    /// reserved prefix are left alone.
    pub async fn purge_namespace(&self) -> StoreResult<()> {
        let keys = self.storage.keys_with_prefix(E2E_PREFIX)?;
        log::debug!("Purging {} crypto store keys", keys.len());
        for key in keys {
            self.storage.remove(&key)?;
        }
        Ok(())
    }

    /// Run `func` as a unit of work.
    ///
    /// The substrate has no transactions: `func` is invoked immediately with
    /// no transaction handle and gets no isolation or atomicity.
    pub async fn do_txn<T>(
        &self,
        _mode: TransactionMode,
        func: impl FnOnce(Option<&Transaction>) -> T,
    ) -> T {
        func(None)
    }

    // ═══════════════════════════════════════════════════════════
    // MIGRATION STATE
    // ═══════════════════════════════════════════════════════════

    /// Absence reads as [`MigrationState::NotStarted`].
    pub async fn get_migration_state(&self) -> StoreResult<MigrationState> {
        Ok(self.read_json(KEY_MIGRATION_STATE)?.unwrap_or_default())
    }

    /// Overwrites unconditionally; moving forward is the caller's concern.
    pub async fn set_migration_state(&self, state: MigrationState) -> StoreResult<()> {
        log::debug!("Setting crypto migration state to {state:?}");
        self.write_json(KEY_MIGRATION_STATE, &state)
    }

    // ═══════════════════════════════════════════════════════════
    // ACCOUNT AND IDENTITY
    // ═══════════════════════════════════════════════════════════

    pub async fn get_account(&self) -> StoreResult<Option<String>> {
        self.read_json(KEY_ACCOUNT)
    }

    pub async fn store_account(&self, account_pickle: &str) -> StoreResult<()> {
        self.write_json(KEY_ACCOUNT, account_pickle)
    }

    /// Remove the account pickle only. Sessions, rooms and every other
    /// record are kept; use [`Self::purge_namespace`] for a full wipe.
    pub async fn delete_account(&self) -> StoreResult<()> {
        self.storage.remove(KEY_ACCOUNT)?;
        Ok(())
    }

    pub async fn get_cross_signing_keys(&self) -> StoreResult<Option<CrossSigningKeys>> {
        self.read_json(KEY_CROSS_SIGNING_KEYS)
    }

    pub async fn store_cross_signing_keys(&self, keys: &CrossSigningKeys) -> StoreResult<()> {
        self.write_json(KEY_CROSS_SIGNING_KEYS, keys)
    }

    /// Cached secret-storage private key of type `secret_type`
    /// (e.g. `m.megolm_backup.v1`). The payload format belongs to the caller.
    pub async fn get_secret_store_private_key<V: DeserializeOwned>(
        &self,
        secret_type: &str,
    ) -> StoreResult<Option<V>> {
        self.read_json(&namespace::secret_store_private_key_key(secret_type))
    }

    pub async fn store_secret_store_private_key<V: Serialize + ?Sized>(
        &self,
        secret_type: &str,
        key: &V,
    ) -> StoreResult<()> {
        self.write_json(&namespace::secret_store_private_key_key(secret_type), key)
    }

    pub async fn get_device_data<V: DeserializeOwned>(&self) -> StoreResult<Option<V>> {
        self.read_json(KEY_DEVICE_DATA)
    }

    pub async fn store_device_data<V: Serialize + ?Sized>(&self, device_data: &V) -> StoreResult<()> {
        self.write_json(KEY_DEVICE_DATA, device_data)
    }

    // ═══════════════════════════════════════════════════════════
    // PAIRWISE SESSIONS
    // ═══════════════════════════════════════════════════════════

    /// Total number of pairwise sessions across all devices.
    pub async fn count_sessions(&self) -> StoreResult<usize> {
        let mut count = 0;
        for key in self.storage.keys_with_prefix(SESSIONS_PREFIX)? {
            if let Some(device_key) = namespace::device_key_from_sessions_key(&key) {
                count += self.read_device_sessions(device_key)?.len();
            }
        }
        Ok(count)
    }

    pub async fn get_session(
        &self,
        device_key: &str,
        session_id: &str,
    ) -> StoreResult<Option<SessionInfo>> {
        Ok(self.read_device_sessions(device_key)?.remove(session_id))
    }

    /// All sessions of `device_key`, keyed by session id.
    pub async fn get_sessions(&self, device_key: &str) -> StoreResult<BTreeMap<String, SessionInfo>> {
        self.read_device_sessions(device_key)
    }

    /// Insert or overwrite one session in its device's mapping. Other entries
    /// are written back exactly as they were read.
    pub async fn store_session(
        &self,
        device_key: &str,
        session_id: &str,
        info: SessionInfo,
    ) -> StoreResult<()> {
        let entry =
            serde_json::to_value(info).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let mut entries = self.read_raw_device_sessions(device_key)?;
        entries.insert(session_id.to_owned(), entry);
        self.write_raw_device_sessions(device_key, &entries)
    }

    /// The first [`SESSION_BATCH_SIZE`] sessions still in the store.
    ///
    /// The scan always restarts from the first key, so a drain is a loop of
    /// fetch-then-[`Self::delete_sessions_batch`] until `None` comes back.
    /// `None` means no session is left; a returned batch is never empty.
    pub async fn get_sessions_batch(&self) -> StoreResult<Option<Vec<SessionRecord>>> {
        let mut batch = Vec::new();
        for key in self.storage.keys_with_prefix(SESSIONS_PREFIX)? {
            let Some(device_key) = namespace::device_key_from_sessions_key(&key) else {
                continue;
            };
            for (session_id, info) in self.read_device_sessions(device_key)? {
                batch.push(SessionRecord {
                    device_key: device_key.to_owned(),
                    session_id,
                    info,
                });
                if batch.len() >= SESSION_BATCH_SIZE {
                    return Ok(Some(batch));
                }
            }
        }
        log::debug!("Session batch of {} (end of store)", batch.len());
        Ok((!batch.is_empty()).then_some(batch))
    }

    /// Delete the given sessions. A device whose last session goes away has
    /// its key removed. Unknown sessions are ignored.
    pub async fn delete_sessions_batch(&self, sessions: &[OlmSessionId]) -> StoreResult<()> {
        let mut by_device: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for id in sessions {
            by_device
                .entry(id.device_key.as_str())
                .or_default()
                .push(id.session_id.as_str());
        }
        for (device_key, session_ids) in by_device {
            let mut stored = self.read_raw_device_sessions(device_key)?;
            let before = stored.len();
            for session_id in session_ids {
                stored.remove(session_id);
            }
            if stored.len() != before {
                self.write_raw_device_sessions(device_key, &stored)?;
            }
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════
    // SESSION PROBLEMS
    // ═══════════════════════════════════════════════════════════

    /// Record a problem with `device_key`'s sessions, stamped with the current time.
    pub async fn store_session_problem(
        &self,
        device_key: &str,
        problem_type: &str,
        fixed: bool,
    ) -> StoreResult<()> {
        let key = namespace::session_problems_key(device_key);
        let mut problems: Vec<SessionProblem> = self.read_json(&key)?.unwrap_or_default();
        problems.push(SessionProblem {
            problem_type: problem_type.to_owned(),
            fixed,
            time: crate::utils::now_millis(),
        });
        problems.sort_by_key(|p| p.time);
        self.write_json(&key, &problems)
    }

    /// The first problem recorded after `timestamp` (ms), carrying the
    /// `fixed` flag of the latest problem. With nothing newer, the latest
    /// problem unless it has been fixed.
    pub async fn get_session_problem(
        &self,
        device_key: &str,
        timestamp: u64,
    ) -> StoreResult<Option<SessionProblem>> {
        let problems: Vec<SessionProblem> = self
            .read_json(&namespace::session_problems_key(device_key))?
            .unwrap_or_default();
        let Some(last) = problems.last() else {
            return Ok(None);
        };
        if let Some(problem) = problems.iter().find(|p| p.time > timestamp) {
            return Ok(Some(SessionProblem {
                fixed: last.fixed,
                ..problem.clone()
            }));
        }
        Ok((!last.fixed).then(|| last.clone()))
    }

    /// Devices from `devices` that have not been told about a decryption
    /// error yet. Those returned are recorded as notified.
    pub async fn filter_out_notified_error_devices(
        &self,
        devices: Vec<ErrorDevice>,
    ) -> StoreResult<Vec<ErrorDevice>> {
        let mut notified: BTreeMap<String, BTreeMap<String, bool>> = self
            .read_json(KEY_NOTIFIED_ERROR_DEVICES)?
            .unwrap_or_default();
        let mut fresh = Vec::new();
        for device in devices {
            let user_devices = notified.entry(device.user_id.clone()).or_default();
            if !user_devices.contains_key(&device.device_id) {
                user_devices.insert(device.device_id.clone(), true);
                fresh.push(device);
            }
        }
        self.write_json(KEY_NOTIFIED_ERROR_DEVICES, &notified)?;
        Ok(fresh)
    }

    // ═══════════════════════════════════════════════════════════
    // INBOUND GROUP SESSIONS
    // ═══════════════════════════════════════════════════════════

    /// A group session and its withheld record, looked up independently.
    pub async fn get_inbound_group_session(
        &self,
        sender_key: &str,
        session_id: &str,
    ) -> StoreResult<(Option<InboundGroupSessionData>, Option<WithheldRecord>)> {
        let session =
            self.read_json(&namespace::inbound_group_session_key(sender_key, session_id))?;
        let withheld = self.read_json(&namespace::inbound_group_session_withheld_key(
            sender_key, session_id,
        ))?;
        Ok((session, withheld))
    }

    pub async fn store_inbound_group_session(
        &self,
        sender_key: &str,
        session_id: &str,
        session_data: &InboundGroupSessionData,
    ) -> StoreResult<()> {
        self.write_json(
            &namespace::inbound_group_session_key(sender_key, session_id),
            session_data,
        )
    }

    /// Store the session only if none is stored under the same ids.
    /// Returns whether it was written.
    pub async fn add_inbound_group_session(
        &self,
        sender_key: &str,
        session_id: &str,
        session_data: &InboundGroupSessionData,
    ) -> StoreResult<bool> {
        let key = namespace::inbound_group_session_key(sender_key, session_id);
        if self.storage.get(&key)?.is_some() {
            return Ok(false);
        }
        self.write_json(&key, session_data)?;
        Ok(true)
    }

    pub async fn store_inbound_group_session_withheld(
        &self,
        sender_key: &str,
        session_id: &str,
        withheld: &WithheldRecord,
    ) -> StoreResult<()> {
        self.write_json(
            &namespace::inbound_group_session_withheld_key(sender_key, session_id),
            withheld,
        )
    }

    /// Number of group-session keys that decode to a sender key and session
    /// id. Malformed keys are not counted, as batch reads skip them.
    pub async fn count_inbound_group_sessions(&self) -> StoreResult<usize> {
        Ok(self
            .storage
            .keys_with_prefix(INBOUND_GROUP_SESSION_PREFIX)?
            .iter()
            .filter(|key| namespace::parse_inbound_group_session_key(key).is_some())
            .count())
    }

    /// The first [`SESSION_BATCH_SIZE`] group sessions still in the store,
    /// each flagged with whether it awaits backup. Same drain contract as
    /// [`Self::get_sessions_batch`].
    pub async fn get_inbound_group_sessions_batch(
        &self,
    ) -> StoreResult<Option<Vec<GroupSessionRecord>>> {
        let needs_backup = self.read_backup_index()?;
        let mut batch = Vec::new();
        for key in self.storage.keys_with_prefix(INBOUND_GROUP_SESSION_PREFIX)? {
            let Some((sender_key, session_id)) = namespace::parse_inbound_group_session_key(&key)
            else {
                log::warn!("Skipping malformed group session key {key}");
                continue;
            };
            let Some(session_data) = self.read_json::<InboundGroupSessionData>(&key)? else {
                continue;
            };
            let composite = namespace::group_session_id(sender_key, session_id);
            batch.push(GroupSessionRecord {
                sender_key: sender_key.to_owned(),
                session_id: session_id.to_owned(),
                session_data,
                needs_backup: needs_backup.contains_key(&composite),
            });
            if batch.len() >= SESSION_BATCH_SIZE {
                return Ok(Some(batch));
            }
        }
        log::debug!("Group session batch of {} (end of store)", batch.len());
        Ok((!batch.is_empty()).then_some(batch))
    }

    /// Delete the given group sessions and drop them from the backup index.
    /// Withheld records are kept. Unknown sessions are ignored.
    pub async fn delete_inbound_group_sessions_batch(
        &self,
        sessions: &[GroupSessionId],
    ) -> StoreResult<()> {
        let mut index = self.read_backup_index()?;
        let indexed = index.len();
        for id in sessions {
            self.storage.remove(&namespace::inbound_group_session_key(
                &id.sender_key,
                &id.session_id,
            ))?;
            index.remove(&namespace::group_session_id(&id.sender_key, &id.session_id));
        }
        if index.len() != indexed {
            if index.is_empty() {
                self.storage.remove(KEY_SESSIONS_NEEDING_BACKUP)?;
            } else {
                self.write_json(KEY_SESSIONS_NEEDING_BACKUP, &index)?;
            }
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════
    // BACKUP FLAGS
    // ═══════════════════════════════════════════════════════════

    /// Flag sessions as awaiting backup. Flags are never cleared here.
    pub async fn mark_sessions_needing_backup(&self, sessions: &[GroupSessionId]) -> StoreResult<()> {
        if sessions.is_empty() {
            return Ok(());
        }
        let mut index = self.read_backup_index()?;
        for id in sessions {
            index.insert(namespace::group_session_id(&id.sender_key, &id.session_id), true);
        }
        self.write_json(KEY_SESSIONS_NEEDING_BACKUP, &index)
    }

    pub async fn count_sessions_needing_backup(&self) -> StoreResult<usize> {
        Ok(self.read_backup_index()?.len())
    }

    // ═══════════════════════════════════════════════════════════
    // ROOMS
    // ═══════════════════════════════════════════════════════════

    pub async fn store_room(&self, room_id: &str, room: &RoomEncryption) -> StoreResult<()> {
        self.write_json(&namespace::room_key(room_id), room)
    }

    /// Every stored room configuration, keyed by room id.
    pub async fn get_rooms(&self) -> StoreResult<BTreeMap<String, RoomEncryption>> {
        let mut rooms = BTreeMap::new();
        for key in self.storage.keys_with_prefix(ROOMS_PREFIX)? {
            let Some(room_id) = namespace::room_id_from_key(&key) else {
                continue;
            };
            if let Some(room) = self.read_json(&key)? {
                rooms.insert(room_id.to_owned(), room);
            }
        }
        Ok(rooms)
    }
}
