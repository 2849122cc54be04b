use rand::rngs::OsRng;
use rand::RngCore;

pub const TOKEN_BYTES: usize = 32;

/// 32 OS-random bytes as 64 lowercase hex chars
pub fn generate_secure_token() -> String {
    random_hex(TOKEN_BYTES)
}

/// Session identifier, same contract as [`generate_secure_token`]
pub fn generate_session_id() -> String {
    random_hex(TOKEN_BYTES)
}

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
