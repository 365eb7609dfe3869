//! Client-generated ids in the server's ObjectId-like hex layout.
//!
//! ```text
//!  ┌──────────┬────────┬──────┬────────┐
//!  │ seconds  │ random │ rand │ counter│   comment id (24 hex)
//!  │ 8 hex    │ 6 hex  │ 4 hex│ 6 hex  │
//!  └──────────┴────────┴──────┴────────┘
//!  └────────── change id (18 hex) ──────┘
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// 18-hex id used as the track-changes marker (`meta.tc`).
pub fn change_id() -> String {
    let random = Uuid::new_v4();
    let bytes = random.as_bytes();
    let machine = u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]);
    let pid = u16::from_be_bytes([bytes[3], bytes[4]]) & 0x7fff;
    format!("{:08x}{machine:06x}{pid:04x}", unix_secs() as u32)
}

/// 24-hex id for a new comment thread; `counter` keeps ids from one client
/// distinct within the same second.
pub fn comment_id(counter: u32) -> String {
    format!("{}{:06x}", change_id(), counter & 0x00ff_ffff)
}

/// 13-digit millisecond timestamp used to bust the socket handshake cache.
pub fn handshake_timestamp() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    format!("{millis:013}")
}
