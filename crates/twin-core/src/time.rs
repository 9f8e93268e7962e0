use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, SecondsFormat, Utc};

/// Milliseconds since UNIX epoch.
pub type EpochMs = i64;

pub const MS_PER_SECOND: i64 = 1_000;

pub fn now_ms() -> EpochMs {
    let dur = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    dur.as_millis() as i64
}

fn utc(ms: EpochMs) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

pub fn to_rfc3339(ms: EpochMs) -> String {
    utc(ms).to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Default snapshot label, e.g. `state_20240501_134502_017`.
pub fn snapshot_label(ms: EpochMs) -> String {
    format!("state_{}", utc(ms).format("%Y%m%d_%H%M%S_%3f"))
}
