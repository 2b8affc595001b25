use rand::Rng;
use sha2::{Digest, Sha256};

/// Length of the raw random bytes (32 bytes -> 64 hex chars, 256 bits).
const TOKEN_BYTES: usize = 32;

/// Generate an opaque session token from a cryptographically secure source.
pub fn generate_session_token() -> String {
    let mut buf = [0u8; TOKEN_BYTES];
    rand::rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Constant-time string comparison for secrets.
///
/// Both inputs are hashed first so the comparison operates on fixed-length
/// digests; the fold over the digest bytes never short-circuits.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let da = Sha256::digest(a.as_bytes());
    let db = Sha256::digest(b.as_bytes());
    da.iter().zip(db.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
