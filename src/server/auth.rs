//! Challenge/response authentication over a pre-shared key.
//!
//! The server issues a random 128-bit challenge in WELCOME; the client
//! answers with an HMAC-SHA256 over it keyed by the authkey. The default
//! key is a sentinel that only ever matches itself and draws a warning.

use rand::RngCore;
use sha2::{Digest, Sha256};

const BLOCK_SIZE: usize = 64;

/// HMAC-SHA256 (RFC 2104) built on the sha2 digest.
pub fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut block = [0u8; BLOCK_SIZE];
    if key.len() > BLOCK_SIZE {
        let digest = Sha256::digest(key);
        block[..digest.len()].copy_from_slice(&digest);
    } else {
        block[..key.len()].copy_from_slice(key);
    }

    let mut inner = Sha256::new();
    let ipad: Vec<u8> = block.iter().map(|byte| byte ^ 0x36).collect();
    inner.update(&ipad);
    inner.update(message);
    let inner_digest = inner.finalize();

    let mut outer = Sha256::new();
    let opad: Vec<u8> = block.iter().map(|byte| byte ^ 0x5c).collect();
    outer.update(&opad);
    outer.update(inner_digest);
    outer.finalize().into()
}

/// Random 128-bit value, hex-encoded. Used for challenges and for
/// autogenerated cluster keys.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex_encode(&bytes)
}

/// MAC a challenge with the shared key, hex-encoded for the wire.
pub fn sign_challenge(key: &str, challenge: &str) -> String {
    hex_encode(&hmac_sha256(key.as_bytes(), challenge.as_bytes()))
}

/// Constant-time comparison of the presented MAC against the expected one.
pub fn verify_challenge(key: &str, challenge: &str, mac: &str) -> bool {
    let expected = sign_challenge(key, challenge);
    if expected.len() != mac.len() {
        return false;
    }
    expected
        .bytes()
        .zip(mac.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}
