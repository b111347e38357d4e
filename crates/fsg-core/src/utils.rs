use chrono::{DateTime, Local, Utc};
use sha2::{Digest, Sha256};

// ============== Timestamp Helpers ==============

/// Human-readable local time, as shown to admins (`2026-01-31 18:04:00`).
pub fn human_time(t: DateTime<Utc>) -> String {
    t.with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

/// Directory-safe stamp used for backup folders (`20260131_180400`).
pub fn backup_stamp(t: DateTime<Utc>) -> String {
    t.with_timezone(&Local).format("%Y%m%d_%H%M%S").to_string()
}

// ============== Secret Fingerprints ==============

/// Short, stable fingerprint of a secret so logs can correlate tokens without
/// revealing them.
pub fn fingerprint(secret: &str) -> String {
    let mut h = Sha256::new();
    h.update(secret.as_bytes());
    let digest = h.finalize();
    hex_prefix(&digest, 12)
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(len);
    for b in bytes {
        if out.len() >= len {
            break;
        }
        let _ = write!(out, "{b:02x}");
    }
    out.truncate(len);
    out
}

// ============== Formatting ==============

/// `90` -> `1h 30m`, `5` -> `5m`.
pub fn format_minutes(minutes: u32) -> String {
    let hours = minutes / 60;
    let mins = minutes % 60;
    match (hours, mins) {
        (0, m) => format!("{m}m"),
        (h, 0) => format!("{h}h"),
        (h, m) => format!("{h}h {m}m"),
    }
}
