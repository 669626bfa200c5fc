//! Key namespace codec — maps structured identifiers to flat substrate keys.
//!
//! Every key this crate writes lives under [`E2E_PREFIX`], so the crypto
//! store can share a substrate with unrelated data. The layout is fixed for
//! interop with data persisted by earlier clients:
//!
//! ```text
//! crypto.migration
//! crypto.account
//! crypto.cross_signing_keys
//! crypto.device_data
//! crypto.notified_error_devices
//! crypto.sessionsneedingbackup
//! crypto.sessions/<deviceKey>
//! crypto.session.problems/<deviceKey>
//! crypto.inboundgroupsessions/<senderKey>/<sessionId>
//! crypto.inboundgroupsessions.withheld/<senderKey>/<sessionId>
//! crypto.rooms/<roomId>
//! crypto.ssss_cache.<type>
//! ```

// ═══════════════════════════════════════════════════════════════
// PREFIXES AND FIXED KEYS
// ═══════════════════════════════════════════════════════════════

/// Reserved prefix shared by every key of the crypto store.
pub const E2E_PREFIX: &str = "crypto.";

pub const KEY_MIGRATION_STATE: &str = "crypto.migration";
pub const KEY_ACCOUNT: &str = "crypto.account";
pub const KEY_CROSS_SIGNING_KEYS: &str = "crypto.cross_signing_keys";
pub const KEY_DEVICE_DATA: &str = "crypto.device_data";
pub const KEY_NOTIFIED_ERROR_DEVICES: &str = "crypto.notified_error_devices";
pub const KEY_SESSIONS_NEEDING_BACKUP: &str = "crypto.sessionsneedingbackup";

pub const SESSIONS_PREFIX: &str = "crypto.sessions/";
pub const SESSION_PROBLEMS_PREFIX: &str = "crypto.session.problems/";
pub const INBOUND_GROUP_SESSION_PREFIX: &str = "crypto.inboundgroupsessions/";
pub const INBOUND_GROUP_SESSION_WITHHELD_PREFIX: &str = "crypto.inboundgroupsessions.withheld/";
pub const ROOMS_PREFIX: &str = "crypto.rooms/";
pub const SECRET_STORE_PREFIX: &str = "crypto.ssss_cache.";

/// Encoded length of a sender key: unpadded base64 of a 32-byte Curve25519 key.
///
/// Group-session keys are decoded by slicing at this offset, never by
/// splitting on `/`: session ids are base64 too and may contain the separator.
pub const SENDER_KEY_LENGTH: usize = 43;

const SEPARATOR: char = '/';

// ═══════════════════════════════════════════════════════════════
// ENCODERS
// ═══════════════════════════════════════════════════════════════

/// Key holding every pairwise session of one device as a single mapping.
pub fn sessions_key(device_key: &str) -> String {
    format!("{SESSIONS_PREFIX}{device_key}")
}

pub fn session_problems_key(device_key: &str) -> String {
    format!("{SESSION_PROBLEMS_PREFIX}{device_key}")
}

pub fn inbound_group_session_key(sender_key: &str, session_id: &str) -> String {
    format!("{INBOUND_GROUP_SESSION_PREFIX}{}", group_session_id(sender_key, session_id))
}

pub fn inbound_group_session_withheld_key(sender_key: &str, session_id: &str) -> String {
    format!(
        "{INBOUND_GROUP_SESSION_WITHHELD_PREFIX}{}",
        group_session_id(sender_key, session_id)
    )
}

pub fn room_key(room_id: &str) -> String {
    format!("{ROOMS_PREFIX}{room_id}")
}

pub fn secret_store_private_key_key(secret_type: &str) -> String {
    format!("{SECRET_STORE_PREFIX}{secret_type}")
}

/// Composite `<senderKey>/<sessionId>` id, as used in the backup flag index.
pub fn group_session_id(sender_key: &str, session_id: &str) -> String {
    format!("{sender_key}{SEPARATOR}{session_id}")
}

// ═══════════════════════════════════════════════════════════════
// DECODERS
// ═══════════════════════════════════════════════════════════════

/// Extract the device key from a `crypto.sessions/<deviceKey>` key.
pub fn device_key_from_sessions_key(key: &str) -> Option<&str> {
    key.strip_prefix(SESSIONS_PREFIX)
}

/// Extract the room id from a `crypto.rooms/<roomId>` key.
pub fn room_id_from_key(key: &str) -> Option<&str> {
    key.strip_prefix(ROOMS_PREFIX)
}

/// Split a `<senderKey>/<sessionId>` composite id at the fixed sender-key offset.
///
/// Returns `None` if the id is too short to hold a sender key, a separator
/// and a non-empty session id, or if the separator is not where it must be.
pub fn parse_group_session_id(id: &str) -> Option<(&str, &str)> {
    if id.len() <= SENDER_KEY_LENGTH + 1 || !id.is_char_boundary(SENDER_KEY_LENGTH) {
        return None;
    }
    let (sender_key, rest) = id.split_at(SENDER_KEY_LENGTH);
    let session_id = rest.strip_prefix(SEPARATOR)?;
    Some((sender_key, session_id))
}

/// Decode a `crypto.inboundgroupsessions/<senderKey>/<sessionId>` key.
pub fn parse_inbound_group_session_key(key: &str) -> Option<(&str, &str)> {
    key.strip_prefix(INBOUND_GROUP_SESSION_PREFIX)
        .and_then(parse_group_session_id)
}
