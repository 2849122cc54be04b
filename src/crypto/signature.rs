use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Payload travelling with its HMAC-SHA256 signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedMessage {
    pub payload: String,
    /// Lowercase hex
    pub signature: String,
}

pub(crate) fn sign(secret: &[u8], data: &[u8]) -> String {
    hex::encode(mac(secret, data))
}

pub(crate) fn verify(secret: &[u8], data: &[u8], signature_hex: &str) -> bool {
    let Ok(provided) = hex::decode(signature_hex) else {
        return false;
    };
    let expected = mac(secret, data);
    if expected.is_empty() || expected.len() != provided.len() {
        return false;
    }
    bool::from(expected.as_slice().ct_eq(provided.as_slice()))
}

fn mac(secret: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}
