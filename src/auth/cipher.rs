/// AES-256-GCM encryption for secrets stored at rest.
///
/// Output format is `base64(nonce || ciphertext || tag)` with a 12-byte
/// random nonce per call.
///
/// The AES key is `SHA-256(key string)` with no stretching. Ciphertexts
/// already in storage depend on this derivation, so it must not change
/// without a migration. A low-entropy key string is therefore weak.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::configuration::EncryptionSettings;
use crate::error::{AppError, ConfigError, CryptoError};

const NONCE_LEN: usize = 12;

/// Encrypts and decrypts strings, falling back to the configured key when
/// the caller passes an empty one.
#[derive(Clone)]
pub struct SecretCipher {
    default_key: Option<String>,
}

impl SecretCipher {
    pub fn new(settings: &EncryptionSettings) -> Self {
        Self {
            default_key: settings.key.clone().filter(|key| !key.is_empty()),
        }
    }

    fn resolve_key<'a>(&'a self, key: &'a str) -> Result<&'a str, AppError> {
        if !key.is_empty() {
            return Ok(key);
        }
        self.default_key.as_deref().ok_or_else(|| {
            AppError::Config(ConfigError::MissingRequired("encryption.key".to_string()))
        })
    }

    fn create_cipher(key: &str) -> Aes256Gcm {
        let digest = Sha256::digest(key.as_bytes());
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(digest.as_slice()))
    }

    /// Encrypt `plaintext` and return the base64 encoded envelope.
    pub fn encrypt(&self, key: &str, plaintext: &str) -> Result<String, AppError> {
        let cipher = Self::create_cipher(self.resolve_key(key)?);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::Encryption)?;

        let mut envelope = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        envelope.extend_from_slice(&nonce_bytes);
        envelope.extend_from_slice(&ciphertext);

        Ok(general_purpose::STANDARD.encode(envelope))
    }

    /// Decrypt an envelope produced by [`SecretCipher::encrypt`].
    ///
    /// Malformed input, a wrong key and tampering all yield the same
    /// `CryptoError::Decryption`.
    pub fn decrypt(&self, key: &str, encoded: &str) -> Result<String, AppError> {
        let cipher = Self::create_cipher(self.resolve_key(key)?);

        let data = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| CryptoError::Decryption)?;

        if data.len() < NONCE_LEN {
            return Err(CryptoError::Decryption.into());
        }

        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CryptoError::Decryption)?;

        String::from_utf8(plaintext).map_err(|_| CryptoError::Decryption.into())
    }
}
