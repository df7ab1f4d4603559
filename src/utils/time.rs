use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// return millisecond
pub(crate) fn get_now_as_millis() -> u64 {
    let now = SystemTime::now();
    // Clocks set before the epoch report 0 rather than aborting a watch
    let since_epoch = now.duration_since(UNIX_EPOCH).unwrap_or_default();
    since_epoch.as_millis() as u64
}

