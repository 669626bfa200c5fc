//! Store behaviour against the persistent and host-callback substrates.

use std::sync::Arc;

use e2e_kvstore::api::types::{
    GroupSessionId, InboundGroupSessionData, MigrationState, OlmSessionId, RoomEncryption,
    SessionInfo,
};
use e2e_kvstore::{
    CryptoSessionStore, HostStorage, KeyValueStorage, SESSION_BATCH_SIZE, StoreConfig,
};
use futures::executor::block_on;
use parking_lot::Mutex;

const SENDER: &str = "cUrVe25519sEnDeRkEy/wItHsLaShEs0123456789ab";

type HostEntries = Arc<Mutex<Vec<(String, String)>>>;

/// Insertion-ordered namespace, like a browser `localStorage`, together with
/// the host-side entries it forwards to.
fn host_storage() -> (HostStorage, HostEntries) {
    let data: HostEntries = Arc::default();
    let (get, set, remove, len, key_at) =
        (data.clone(), data.clone(), data.clone(), data.clone(), data.clone());
    let storage = HostStorage::new(
        move |key| get.lock().iter().find(|(k, _)| k == key).map(|(_, v)| v.clone()),
        move |key, value| {
            let mut entries = set.lock();
            match entries.iter_mut().find(|(k, _)| k == key) {
                Some(entry) => entry.1 = value.to_owned(),
                None => entries.push((key.to_owned(), value.to_owned())),
            }
        },
        move |key| remove.lock().retain(|(k, _)| k != key),
        move || len.lock().len(),
        move |index| key_at.lock().get(index).map(|(k, _)| k.clone()),
    );
    (storage, data)
}

fn sqlite_store() -> CryptoSessionStore<e2e_kvstore::SqliteStorage> {
    CryptoSessionStore::open(&StoreConfig::in_memory(vec![3u8; 32])).unwrap()
}

async fn exercise<S: KeyValueStorage>(store: &CryptoSessionStore<S>) {
    assert_eq!(SENDER.len(), e2e_kvstore::namespace::SENDER_KEY_LENGTH);

    assert!(!store.contains_data().await.unwrap());
    assert_eq!(store.get_migration_state().await.unwrap(), MigrationState::NotStarted);

    store.storage().set("unrelated", "value").unwrap();
    assert!(!store.contains_data().await.unwrap());

    // Legacy bare-pickle entry next to a current one.
    store
        .storage()
        .set("crypto.sessions/legacydevice", r#"{"old":"BARE"}"#)
        .unwrap();
    assert!(store.contains_data().await.unwrap());

    let total = SESSION_BATCH_SIZE + 11;
    for i in 0..total {
        store
            .store_session(&format!("device{}", i % 4), &format!("s{i}"), SessionInfo::new(format!("p{i}")))
            .await
            .unwrap();
    }
    assert_eq!(store.count_sessions().await.unwrap(), total + 1);
    assert_eq!(
        store.get_session("legacydevice", "old").await.unwrap(),
        Some(SessionInfo::new("BARE"))
    );

    let mut drained = 0;
    while let Some(batch) = store.get_sessions_batch().await.unwrap() {
        drained += batch.len();
        let ids: Vec<OlmSessionId> = batch
            .into_iter()
            .map(|s| OlmSessionId::new(s.device_key, s.session_id))
            .collect();
        store.delete_sessions_batch(&ids).await.unwrap();
    }
    assert_eq!(drained, total + 1);
    assert!(store.storage().keys_with_prefix("crypto.sessions/").unwrap().is_empty());

    store
        .store_inbound_group_session(SENDER, "abc/def", &InboundGroupSessionData::new("!r", "G"))
        .await
        .unwrap();
    store
        .mark_sessions_needing_backup(&[GroupSessionId::new(SENDER, "abc/def")])
        .await
        .unwrap();
    let batch = store.get_inbound_group_sessions_batch().await.unwrap().unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].sender_key, SENDER);
    assert_eq!(batch[0].session_id, "abc/def");
    assert!(batch[0].needs_backup);
    store
        .delete_inbound_group_sessions_batch(&[GroupSessionId::new(SENDER, "abc/def")])
        .await
        .unwrap();
    assert_eq!(store.get_inbound_group_sessions_batch().await.unwrap(), None);
    assert_eq!(store.count_sessions_needing_backup().await.unwrap(), 0);

    store
        .store_room("!r:example.org", &RoomEncryption::new("m.megolm.v1.aes-sha2"))
        .await
        .unwrap();
    store
        .set_migration_state(MigrationState::RoomSettingsMigrated)
        .await
        .unwrap();
    assert_eq!(store.get_rooms().await.unwrap().len(), 1);
    assert_eq!(
        store.get_migration_state().await.unwrap(),
        MigrationState::RoomSettingsMigrated
    );

    store.purge_namespace().await.unwrap();
    assert!(!store.contains_data().await.unwrap());
    assert_eq!(store.storage().get("unrelated").unwrap().as_deref(), Some("value"));
}

#[test]
fn sqlite_backend_meets_store_contract() {
    block_on(exercise(&sqlite_store()));
}

#[test]
fn host_backend_meets_store_contract() {
    let (storage, _) = host_storage();
    block_on(exercise(&CryptoSessionStore::new(storage)));
}

#[test]
fn host_callbacks_are_forwarded() {
    let (storage, data) = host_storage();
    storage.set("crypto.account", "\"pickle\"").unwrap();
    storage.set("theme", "dark").unwrap();
    storage.set("crypto.account", "\"newer\"").unwrap();
    assert_eq!(storage.get("crypto.account").unwrap().as_deref(), Some("\"newer\""));
    assert_eq!(storage.len().unwrap(), 2);
    assert_eq!(storage.keys_with_prefix("crypto.").unwrap(), vec!["crypto.account".to_string()]);

    storage.remove("crypto.account").unwrap();
    assert_eq!(*data.lock(), vec![("theme".to_string(), "dark".to_string())]);
    assert_eq!(storage.key_at(0).unwrap().as_deref(), Some("theme"));
    assert_eq!(storage.key_at(1).unwrap(), None);
}

#[test]
fn sqlite_store_survives_reopen() {
    let path = std::env::temp_dir().join(format!("e2e_kvstore_reopen_{}.db", std::process::id()));
    let path = path.to_string_lossy().into_owned();
    let _ = std::fs::remove_file(&path);

    block_on(async {
        {
            let store = CryptoSessionStore::open(&StoreConfig::new(path.clone(), vec![9u8; 32])).unwrap();
            store.store_account("ACCOUNT").await.unwrap();
            store.store_session("dev", "s1", SessionInfo::new("P")).await.unwrap();
        }
        let store = CryptoSessionStore::open(&StoreConfig::new(path.clone(), vec![9u8; 32])).unwrap();
        assert_eq!(store.get_account().await.unwrap().as_deref(), Some("ACCOUNT"));
        assert_eq!(
            store.get_session("dev", "s1").await.unwrap(),
            Some(SessionInfo::new("P"))
        );
        assert!(CryptoSessionStore::exists(store.storage()).unwrap());
    });

    let _ = std::fs::remove_file(&path);
}
