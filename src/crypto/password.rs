//! PBKDF2-HMAC-SHA256 password hashing
//!
//! Encoded form: `pbkdf2-sha256$<iterations>$<salt hex>$<hash hex>`

use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use std::num::NonZeroU32;

use crate::error::CryptoError;

pub const SCHEME: &str = "pbkdf2-sha256";
pub const SALT_LEN: usize = 16;
pub const HASH_LEN: usize = 32;
pub const DEFAULT_ITERATIONS: u32 = 100_000;

pub fn hash_password(plain: &str, iterations: u32) -> Result<String, CryptoError> {
    let iterations = NonZeroU32::new(iterations)
        .ok_or_else(|| CryptoError::InvalidKey("iteration count must be non-zero".to_string()))?;

    let mut salt = [0u8; SALT_LEN];
    SystemRandom::new()
        .fill(&mut salt)
        .map_err(|_| CryptoError::RandomnessUnavailable)?;

    let mut hash = [0u8; HASH_LEN];
    pbkdf2::derive(pbkdf2::PBKDF2_HMAC_SHA256, iterations, &salt, plain.as_bytes(), &mut hash);

    Ok(format!(
        "{}${}${}${}",
        SCHEME,
        iterations,
        hex::encode(salt),
        hex::encode(hash)
    ))
}

/// Constant-time check. Malformed encodings verify as `false`.
pub fn verify_password(plain: &str, encoded: &str) -> bool {
    let Some((iterations, salt, hash)) = parse(encoded) else {
        return false;
    };
    pbkdf2::verify(pbkdf2::PBKDF2_HMAC_SHA256, iterations, &salt, plain.as_bytes(), &hash).is_ok()
}

fn parse(encoded: &str) -> Option<(NonZeroU32, Vec<u8>, Vec<u8>)> {
    let mut parts = encoded.split('$');
    if parts.next()? != SCHEME {
        return None;
    }
    let iterations = NonZeroU32::new(parts.next()?.parse().ok()?)?;
    let salt = hex::decode(parts.next()?).ok()?;
    let hash = hex::decode(parts.next()?).ok()?;
    if parts.next().is_some() || salt.is_empty() || hash.is_empty() {
        return None;
    }
    Some((iterations, salt, hash))
}
