//! Opaque session identifiers.

use rand::Rng;

/// Generate a random session id (16 bytes, hex-encoded to 32 chars).
pub fn generate_session_id() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}
