//! AES-256-GCM with a fresh random 96-bit IV per message

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = NONCE_LEN;
pub const TAG_LEN: usize = 16;

/// Ciphertext, IV and authentication tag as one unit.
/// Each field is lowercase hex on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    #[serde(with = "hex_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub iv: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub tag: Vec<u8>,
}

pub(crate) struct Cipher {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher").field("algorithm", &"AES-256-GCM").finish()
    }
}

impl Cipher {
    pub(crate) fn new(key: &[u8; KEY_LEN]) -> Result<Self, CryptoError> {
        let unbound = UnboundKey::new(&AES_256_GCM, key)
            .map_err(|_| CryptoError::InvalidKey("AES-256-GCM rejected the key".to_string()))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    pub(crate) fn seal(&self, plaintext: &[u8]) -> Result<EncryptedPayload, CryptoError> {
        let mut iv = [0u8; IV_LEN];
        self.rng
            .fill(&mut iv)
            .map_err(|_| CryptoError::RandomnessUnavailable)?;

        let mut in_out = plaintext.to_vec();
        let tag = self
            .key
            .seal_in_place_separate_tag(Nonce::assume_unique_for_key(iv), Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::IntegrityFailure)?;

        Ok(EncryptedPayload {
            ciphertext: in_out,
            iv: iv.to_vec(),
            tag: tag.as_ref().to_vec(),
        })
    }

    /// Any malformed field or authentication failure is `IntegrityFailure`
    pub(crate) fn open(&self, payload: &EncryptedPayload) -> Result<Vec<u8>, CryptoError> {
        if payload.tag.len() != TAG_LEN {
            return Err(CryptoError::IntegrityFailure);
        }
        let nonce = Nonce::try_assume_unique_for_key(&payload.iv)
            .map_err(|_| CryptoError::IntegrityFailure)?;

        let mut in_out = Vec::with_capacity(payload.ciphertext.len() + TAG_LEN);
        in_out.extend_from_slice(&payload.ciphertext);
        in_out.extend_from_slice(&payload.tag);

        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::IntegrityFailure)?;
        Ok(plaintext.to_vec())
    }
}

/// Parse a 64 character hex key
pub fn parse_key_hex(hex_key: &str) -> Result<[u8; KEY_LEN], CryptoError> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| CryptoError::InvalidKey(format!("not hex: {}", e)))?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        CryptoError::InvalidKey(format!("expected {} bytes, got {}", KEY_LEN, b.len()))
    })
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
