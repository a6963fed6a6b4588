// src/crypto.rs

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use secrecy::{ExposeSecret, Secret};
use sha2::{Digest, Sha256};

use crate::error::{AppError, Result};

const NONCE_LEN: usize = 12;

/// Deterministic hashing plus reversible encryption of key strings.
///
/// `hash` is always active and is the lookup/dedup identity of a key.
/// `encrypt`/`decrypt` are identity functions when no encryption key is
/// configured, so plaintext deployments keep working unchanged.
pub struct EncryptionService {
    cipher: Option<Aes256Gcm>,
}

impl EncryptionService {
    pub fn new(encryption_key: Option<Secret<String>>) -> Self {
        let cipher = encryption_key
            .filter(|k| !k.expose_secret().trim().is_empty())
            .map(|k| {
                let digest = Sha256::digest(k.expose_secret().as_bytes());
                Aes256Gcm::new_from_slice(&digest).expect("SHA-256 digest is a valid AES-256 key")
            });
        Self { cipher }
    }

    pub fn is_encrypting(&self) -> bool {
        self.cipher.is_some()
    }

    /// Deterministic hex digest of a plaintext key. Same input, same output,
    /// across runs and processes.
    pub fn hash(&self, plaintext: &str) -> String {
        hex::encode(Sha256::digest(plaintext.as_bytes()))
    }

    /// Encrypts a plaintext key. Output is hex(nonce || ciphertext); identity
    /// when no encryption key is configured.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let Some(cipher) = &self.cipher else {
            return Ok(plaintext.to_string());
        };

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher.encrypt(&nonce, plaintext.as_bytes()).map_err(|e| {
            AppError::Encryption {
                message: format!("encrypt failed: {e}"),
            }
        })?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(hex::encode(out))
    }

    /// Decrypts a value produced by [`encrypt`](Self::encrypt); identity when
    /// no encryption key is configured.
    pub fn decrypt(&self, ciphertext: &str) -> Result<String> {
        let Some(cipher) = &self.cipher else {
            return Ok(ciphertext.to_string());
        };

        let raw = hex::decode(ciphertext).map_err(|e| AppError::Encryption {
            message: format!("ciphertext is not valid hex: {e}"),
        })?;
        if raw.len() <= NONCE_LEN {
            return Err(AppError::Encryption {
                message: "ciphertext too short".to_string(),
            });
        }

        let (nonce_bytes, payload) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = cipher.decrypt(nonce, payload).map_err(|e| AppError::Encryption {
            message: format!("decrypt failed: {e}"),
        })?;

        String::from_utf8(plaintext).map_err(|e| AppError::Encryption {
            message: format!("decrypted value is not UTF-8: {e}"),
        })
    }
}
