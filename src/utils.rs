use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

/// Current wall-clock instant as milliseconds since the Unix epoch. Expiry
/// instants in the store and in RDB files use this scale.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_millis() as u64
}

/// Opaque 40-character hex replication id, generated once per primary.
pub fn generate_replication_id() -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    (0..40)
        .map(|_| HEX[rng.gen_range(0..HEX.len())] as char)
        .collect()
}
