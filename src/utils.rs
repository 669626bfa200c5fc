//! Cross-platform utilities for e2e_kvstore.

use std::time::SystemTime;

/// Get current time as SystemTime.
///
/// - On native platforms: uses `SystemTime::now()`
/// - On WASM: uses `js_sys::Date::now()` converted to SystemTime
///
/// Returns UTC time (not local time).
#[cfg(not(target_arch = "wasm32"))]
pub fn current_time() -> SystemTime {
    SystemTime::now()
}

/// WASM implementation of current_time().
#[cfg(target_arch = "wasm32")]
pub fn current_time() -> SystemTime {
    use std::time::{Duration, UNIX_EPOCH};
    let millis = js_sys::Date::now() as u64;
    UNIX_EPOCH + Duration::from_millis(millis)
}

/// Milliseconds since the Unix epoch, as stored in session-problem records.
pub(crate) fn now_millis() -> u64 {
    current_time()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
