//! Records persisted by the crypto store, and the decode shims for older
//! on-disk encodings.
//!
//! Pickles are opaque strings produced by the crypto engine; the store never
//! looks inside them. Records keep unknown JSON fields in `extra` so data
//! written by newer clients survives a read-modify-write round trip.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ═══════════════════════════════════════════════════════════════
// MIGRATION STATE
// ═══════════════════════════════════════════════════════════════

/// Progress of the one-way migration to another crypto backend.
///
/// Persisted as its integer discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MigrationState {
    #[default]
    NotStarted = 0,
    InitialDataMigrated = 1,
    OlmSessionsMigrated = 2,
    MegolmSessionsMigrated = 3,
    RoomSettingsMigrated = 4,
    InitialOwnKeyQueryDone = 5,
}

#[derive(thiserror::Error, Debug)]
#[error("Unknown migration state: {0}")]
pub struct UnknownMigrationState(u8);

impl TryFrom<u8> for MigrationState {
    type Error = UnknownMigrationState;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::NotStarted,
            1 => Self::InitialDataMigrated,
            2 => Self::OlmSessionsMigrated,
            3 => Self::MegolmSessionsMigrated,
            4 => Self::RoomSettingsMigrated,
            5 => Self::InitialOwnKeyQueryDone,
            other => return Err(UnknownMigrationState(other)),
        })
    }
}

impl From<MigrationState> for u8 {
    fn from(state: MigrationState) -> u8 {
        state as u8
    }
}

// ═══════════════════════════════════════════════════════════════
// PAIRWISE SESSIONS
// ═══════════════════════════════════════════════════════════════

/// One pairwise session as stored in its device's session mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// Pickled session state.
    pub session: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_received_message_ts: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SessionInfo {
    pub fn new(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            last_received_message_ts: None,
            extra: Map::new(),
        }
    }
}

/// A pairwise session together with the ids it is stored under.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub device_key: String,
    pub session_id: String,
    pub info: SessionInfo,
}

/// Identifies one pairwise session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OlmSessionId {
    pub device_key: String,
    pub session_id: String,
}

impl OlmSessionId {
    pub fn new(device_key: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            device_key: device_key.into(),
            session_id: session_id.into(),
        }
    }
}

/// A recorded failure to decrypt with a device's sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionProblem {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub fixed: bool,
    /// Milliseconds since the Unix epoch.
    pub time: u64,
}

// ═══════════════════════════════════════════════════════════════
// GROUP SESSIONS
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundGroupSessionData {
    #[serde(rename = "room_id")]
    pub room_id: String,
    /// Pickled session state.
    pub session: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys_claimed: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub untrusted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_history: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InboundGroupSessionData {
    pub fn new(room_id: impl Into<String>, session: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            session: session.into(),
            keys_claimed: None,
            forwarding_curve25519_key_chain: Vec::new(),
            untrusted: None,
            shared_history: None,
            extra: Map::new(),
        }
    }
}

/// Marker that a group session's key was deliberately not shared with us.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithheldRecord {
    pub room_id: String,
    pub session_id: String,
    pub algorithm: String,
    pub sender_key: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A group session returned from a batch read, flagged with its backup state.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupSessionRecord {
    pub sender_key: String,
    pub session_id: String,
    pub session_data: InboundGroupSessionData,
    pub needs_backup: bool,
}

/// Identifies one inbound group session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupSessionId {
    pub sender_key: String,
    pub session_id: String,
}

impl GroupSessionId {
    pub fn new(sender_key: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            sender_key: sender_key.into(),
            session_id: session_id.into(),
        }
    }
}

/// Composite `<senderKey>/<sessionId>` ids mapped to a "needs backup" flag.
pub type BackupFlagIndex = BTreeMap<String, bool>;

// ═══════════════════════════════════════════════════════════════
// ROOMS, IDENTITY, DEVICES
// ═══════════════════════════════════════════════════════════════

/// Encryption settings active in a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomEncryption {
    pub algorithm: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_period_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_period_msgs: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RoomEncryption {
    pub fn new(algorithm: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            rotation_period_ms: None,
            rotation_period_msgs: None,
            extra: Map::new(),
        }
    }
}

/// Public half of one cross-signing key (`master`, `self_signing`, `user_signing`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossSigningKeyInfo {
    pub user_id: String,
    pub usage: Vec<String>,
    pub keys: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Cross-signing keys keyed by usage name.
pub type CrossSigningKeys = BTreeMap<String, CrossSigningKeyInfo>;

/// A device we may have to tell about an undecryptable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDevice {
    pub user_id: String,
    pub device_id: String,
}

impl ErrorDevice {
    pub fn new(user_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
        }
    }
}

/// Access mode requested for a unit of work; informational only here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
}

/// Handle passed to units of work by transactional backends.
///
/// The key-value substrate has no transactions, so no value of this type is
/// ever handed out by this crate.
#[derive(Debug)]
pub struct Transaction {
    _private: (),
}

// ═══════════════════════════════════════════════════════════════
// READ-TIME COMPATIBILITY
// ═══════════════════════════════════════════════════════════════

/// Stored form of one device's sessions: session id to the entry as written.
///
/// Read-modify-write goes through this raw form so entries that do not
/// decode as [`SessionInfo`] are carried over untouched.
pub(crate) type RawDeviceSessions = BTreeMap<String, Value>;

pub(crate) fn parse_device_sessions(raw: &str) -> Result<RawDeviceSessions, serde_json::Error> {
    serde_json::from_str(raw)
}

/// Decode one entry of a device's session mapping.
///
/// Accepted encodings:
/// - `{"session": "<pickle>", ...}` (current)
/// - `"<pickle>"` (bare pickle written by old clients), read as
///   `{"session": "<pickle>"}`
///
/// The upgrade is not written back. Entries matching neither form are
/// logged and read as absent.
pub(crate) fn decode_session_entry(session_id: &str, value: &Value) -> Option<SessionInfo> {
    match value {
        Value::String(pickle) => Some(SessionInfo::new(pickle.clone())),
        other => match SessionInfo::deserialize(other) {
            Ok(info) => Some(info),
            Err(e) => {
                log::warn!("Skipping undecodable session {session_id}: {e}");
                None
            }
        },
    }
}

/// Decoded view of a device's sessions; undecodable entries are left out.
pub(crate) fn decode_device_sessions(entries: &RawDeviceSessions) -> BTreeMap<String, SessionInfo> {
    entries
        .iter()
        .filter_map(|(id, value)| decode_session_entry(id, value).map(|info| (id.clone(), info)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_state_is_stored_as_integer() {
        assert_eq!(serde_json::to_string(&MigrationState::OlmSessionsMigrated).unwrap(), "2");
        assert_eq!(
            serde_json::from_str::<MigrationState>("4").unwrap(),
            MigrationState::RoomSettingsMigrated
        );
        assert!(serde_json::from_str::<MigrationState>("42").is_err());
        assert_eq!(MigrationState::default(), MigrationState::NotStarted);
    }

    #[test]
    fn legacy_bare_pickles_are_upgraded() {
        let raw = r#"{"s1":"PICKLE","s2":{"session":"P2","lastReceivedMessageTs":17}}"#;
        let sessions = decode_device_sessions(&parse_device_sessions(raw).unwrap());
        assert_eq!(sessions["s1"], SessionInfo::new("PICKLE"));
        assert_eq!(sessions["s2"].session, "P2");
        assert_eq!(sessions["s2"].last_received_message_ts, Some(17));
    }

    #[test]
    fn bad_entries_are_skipped_not_fatal() {
        let raw = parse_device_sessions(
            r#"{"ok":"P","bad":42,"float_ts":{"session":"Q","lastReceivedMessageTs":1.5}}"#,
        )
        .unwrap();
        assert_eq!(raw.len(), 3);
        let sessions = decode_device_sessions(&raw);
        assert_eq!(sessions.len(), 1);
        assert!(sessions.contains_key("ok"));
        assert!(parse_device_sessions("[1,2]").is_err());
        assert!(parse_device_sessions("{not json").is_err());
    }

    #[test]
    fn unknown_fields_survive_round_trip() {
        let raw = r#"{"session":"P","deviceKey":"dk","sessionId":"sid"}"#;
        let info: SessionInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(info.extra["deviceKey"], "dk");
        let back: Value = serde_json::to_value(&info).unwrap();
        assert_eq!(back["sessionId"], "sid");
        assert!(back.get("lastReceivedMessageTs").is_none());
    }

    #[test]
    fn group_session_uses_wire_field_names() {
        let mut data = InboundGroupSessionData::new("!room:example.org", "P");
        data.shared_history = Some(true);
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["room_id"], "!room:example.org");
        assert_eq!(json["sharedHistory"], true);
        assert_eq!(json["forwardingCurve25519KeyChain"], Value::Array(Vec::new()));
        let back: InboundGroupSessionData = serde_json::from_value(json).unwrap();
        assert_eq!(back, data);
    }
}
