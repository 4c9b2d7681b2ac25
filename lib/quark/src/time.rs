use std::time::SystemTime;

/// Returns the current unix timestamp in milliseconds (elapsed since 1970-01-01).
#[inline]
pub fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("System clock predates the unix epoch")
        .as_millis() as u64
}

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01).
#[inline]
pub fn timestamp_secs() -> u64 {
    timestamp_ms() / 1000
}
