//! Cryptographic utility core
//!
//! Key material is supplied by the host (config or environment) and never
//! generated or embedded here. Every failure path fails closed: decryption
//! never yields partial plaintext and verification never errors into `true`.

mod cipher;
mod mask;
mod password;
mod signature;
mod token;

pub use cipher::{parse_key_hex, EncryptedPayload, IV_LEN, KEY_LEN, TAG_LEN};
pub use mask::{
    mask_email, mask_id_card, mask_name, mask_phone, mask_sensitive_data, MaskCategory, Redactor,
};
pub use password::{verify_password, DEFAULT_ITERATIONS};
pub use signature::SignedMessage;
pub use token::{generate_secure_token, generate_session_id};

use tracing::debug;

use crate::config::CryptoConfig;
use crate::error::CryptoError;
use cipher::Cipher;

#[derive(Debug)]
pub struct CryptoCore {
    cipher: Option<Cipher>,
    signing_secret: Option<Vec<u8>>,
    pbkdf2_iterations: u32,
}

impl CryptoCore {
    pub fn new(
        encryption_key: Option<[u8; KEY_LEN]>,
        signing_secret: Option<Vec<u8>>,
        pbkdf2_iterations: u32,
    ) -> Result<Self, CryptoError> {
        let cipher = encryption_key.as_ref().map(Cipher::new).transpose()?;
        Ok(Self {
            cipher,
            signing_secret: signing_secret.filter(|s| !s.is_empty()),
            pbkdf2_iterations,
        })
    }

    /// Resolve key material from config values or the named environment variables
    pub fn from_config(config: &CryptoConfig) -> Result<Self, CryptoError> {
        let key = config
            .resolve_encryption_key()
            .map(|hex_key| parse_key_hex(&hex_key))
            .transpose()?;
        let secret = config.resolve_signing_secret().map(String::into_bytes);

        debug!(
            encryption = key.is_some(),
            signing = secret.is_some(),
            iterations = config.pbkdf2_iterations,
            "Crypto core configured"
        );
        Self::new(key, secret, config.pbkdf2_iterations)
    }

    pub fn has_encryption_key(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn has_signing_secret(&self) -> bool {
        self.signing_secret.is_some()
    }

    /// AES-256-GCM with a fresh IV per call
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedPayload, CryptoError> {
        self.cipher
            .as_ref()
            .ok_or(CryptoError::KeyUnavailable)?
            .seal(plaintext)
    }

    pub fn decrypt(&self, payload: &EncryptedPayload) -> Result<Vec<u8>, CryptoError> {
        self.cipher
            .as_ref()
            .ok_or(CryptoError::KeyUnavailable)?
            .open(payload)
    }

    pub fn encrypt_str(&self, plaintext: &str) -> Result<EncryptedPayload, CryptoError> {
        self.encrypt(plaintext.as_bytes())
    }

    /// Invalid UTF-8 after authentication still counts as an integrity failure
    pub fn decrypt_str(&self, payload: &EncryptedPayload) -> Result<String, CryptoError> {
        String::from_utf8(self.decrypt(payload)?).map_err(|_| CryptoError::IntegrityFailure)
    }

    pub fn hash_password(&self, plain: &str) -> Result<String, CryptoError> {
        password::hash_password(plain, self.pbkdf2_iterations)
    }

    pub fn verify_password(&self, plain: &str, encoded: &str) -> bool {
        password::verify_password(plain, encoded)
    }

    pub fn generate_secure_token(&self) -> String {
        token::generate_secure_token()
    }

    pub fn generate_session_id(&self) -> String {
        token::generate_session_id()
    }

    /// Hex HMAC-SHA256 of `data`
    pub fn create_signature(&self, data: &[u8]) -> Result<String, CryptoError> {
        let secret = self
            .signing_secret
            .as_deref()
            .ok_or(CryptoError::SecretUnavailable)?;
        Ok(signature::sign(secret, data))
    }

    /// Constant-time. Without a secret nothing verifies.
    pub fn verify_signature(&self, data: &[u8], signature_hex: &str) -> bool {
        match self.signing_secret.as_deref() {
            Some(secret) => signature::verify(secret, data, signature_hex),
            None => false,
        }
    }

    pub fn sign_message(&self, payload: impl Into<String>) -> Result<SignedMessage, CryptoError> {
        let payload = payload.into();
        let signature = self.create_signature(payload.as_bytes())?;
        Ok(SignedMessage { payload, signature })
    }

    pub fn verify_message(&self, message: &SignedMessage) -> bool {
        self.verify_signature(message.payload.as_bytes(), &message.signature)
    }

    pub fn mask_sensitive_data(&self, value: &str, category: MaskCategory) -> String {
        mask::mask_sensitive_data(value, category)
    }
}
