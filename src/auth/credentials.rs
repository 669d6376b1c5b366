use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const PBKDF2_ROUNDS: u32 = 100_000;
const SALT_LEN: usize = 16;
const KEY_LEN: usize = 32;

/// Hash a secret for storage: PBKDF2-HMAC-SHA256 with a random 16-byte
/// salt, serialized as `pbkdf2:<salt hex>:<key hex>`.
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let key = pbkdf2_hmac_sha256(password.as_bytes(), &salt, PBKDF2_ROUNDS);
    format!("pbkdf2:{}:{}", hex::encode(salt), hex::encode(key))
}

/// Verify a secret against a stored hash. A stored value that is not in
/// `pbkdf2:` form is treated as a legacy plain-text secret (old profiles
/// stored these); callers upgrade such rows on their next write.
pub fn verify_password(password: &str, stored: &str) -> bool {
    match stored.strip_prefix("pbkdf2:") {
        Some(rest) => {
            let mut parts = rest.splitn(2, ':');
            let (Some(salt_hex), Some(key_hex)) = (parts.next(), parts.next()) else {
                return false;
            };
            let (Ok(salt), Ok(key)) = (hex::decode(salt_hex), hex::decode(key_hex)) else {
                return false;
            };
            let computed = pbkdf2_hmac_sha256(password.as_bytes(), &salt, PBKDF2_ROUNDS);
            constant_time_eq(&computed, &key)
        }
        None => constant_time_eq(password.as_bytes(), stored.as_bytes()),
    }
}

/// PBKDF2 with HMAC-SHA256, single 32-byte output block (RFC 2898).
fn pbkdf2_hmac_sha256(password: &[u8], salt: &[u8], rounds: u32) -> [u8; KEY_LEN] {
    let mut mac = HmacSha256::new_from_slice(password).expect("HMAC accepts any key length");
    mac.update(salt);
    mac.update(&1u32.to_be_bytes());
    let mut block = mac.finalize().into_bytes();

    let mut output = [0u8; KEY_LEN];
    output.copy_from_slice(block.as_slice());
    for _ in 1..rounds {
        let mut mac = HmacSha256::new_from_slice(password).expect("HMAC accepts any key length");
        mac.update(block.as_slice());
        block = mac.finalize().into_bytes();
        for (out, byte) in output.iter_mut().zip(block.as_slice()) {
            *out ^= byte;
        }
    }
    output
}

/// Length-aware comparison that does not short-circuit on the first
/// mismatching byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
