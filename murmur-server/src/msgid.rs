//! Message identifiers.
//!
//! ULIDs: 26 Crockford base32 characters, 48-bit millisecond timestamp
//! followed by 80 random bits, so ids sort by creation time.

use rand::Rng;

const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
const ULID_LEN: usize = 26;

/// Generate an id for a message created now.
pub fn generate() -> String {
    let now_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
    generate_at(now_ms, &mut rand::thread_rng())
}

/// Generate an id for the given millisecond timestamp.
pub fn generate_at<R: Rng + ?Sized>(millis: u64, rng: &mut R) -> String {
    let random: u128 = rng.r#gen::<u128>() & ((1u128 << 80) - 1);
    let value = ((millis as u128 & ((1u128 << 48) - 1)) << 80) | random;

    let mut out = [0u8; ULID_LEN];
    let mut rest = value;
    for slot in out.iter_mut().rev() {
        *slot = CROCKFORD[(rest & 0x1F) as usize];
        rest >>= 5;
    }
    out.iter().map(|&b| b as char).collect()
}
