use aes_gcm::{
    aead::{Aead, KeyInit},
    AeadCore, Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha2::{Digest, Sha256};
use std::sync::Arc;

const NONCE_LENGTH: usize = 12;

/// Service for handling encryption and decryption of stored secrets
#[derive(Debug)]
pub struct EncryptionService {
    master_key: Arc<[u8; 32]>,
}

impl EncryptionService {
    /// Creates a new EncryptionService with the given master key
    /// Accepts either raw 32-byte key or hex-encoded 64-character key
    pub fn new(master_key: &str) -> Result<Self> {
        let key_bytes = if master_key.len() == 32 {
            master_key.as_bytes().to_vec()
        } else if master_key.len() == 64 {
            hex::decode(master_key).map_err(|e| anyhow!("Invalid hex key: {}", e))?
        } else {
            return Err(anyhow!(
                "Master key must be exactly 32 bytes or 64 hex characters"
            ));
        };

        if key_bytes.len() != 32 {
            return Err(anyhow!("Master key must be exactly 32 bytes"));
        }

        let mut key = [0u8; 32];
        key.copy_from_slice(&key_bytes);

        Ok(Self {
            master_key: Arc::new(key),
        })
    }

    /// Creates a new EncryptionService by deriving a key from the given password using SHA-256
    pub fn new_from_password(password: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(password.as_bytes());
        let key_bytes = hasher.finalize();

        let mut key = [0u8; 32];
        key.copy_from_slice(&key_bytes);

        Self {
            master_key: Arc::new(key),
        }
    }

    /// Encrypts data using AES-256-GCM
    /// Returns base64 encoded string containing nonce + ciphertext
    pub fn encrypt(&self, data: &[u8]) -> Result<String> {
        let cipher = Aes256Gcm::new(self.master_key.as_slice().into());
        let nonce = Aes256Gcm::generate_nonce(&mut aes_gcm::aead::OsRng);

        let ciphertext = cipher
            .encrypt(&nonce, data)
            .map_err(|e| anyhow!("Encryption error: {}", e))?;

        let mut combined = nonce.to_vec();
        combined.extend(ciphertext);
        Ok(BASE64.encode(combined))
    }

    /// Decrypts base64 encoded data that was encrypted with encrypt()
    pub fn decrypt(&self, encoded_data: &str) -> Result<Vec<u8>> {
        let data = BASE64
            .decode(encoded_data)
            .map_err(|e| anyhow!("Base64 decode error: {}", e))?;

        if data.len() < NONCE_LENGTH {
            return Err(anyhow!("Invalid encrypted data"));
        }

        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LENGTH);
        let cipher = Aes256Gcm::new(self.master_key.as_slice().into());

        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| anyhow!("Decryption failed: {}", e))?;

        Ok(plaintext)
    }

    /// Encrypts a string and returns base64 encoded encrypted data
    pub fn encrypt_string(&self, data: &str) -> Result<String> {
        self.encrypt(data.as_bytes())
    }

    /// Decrypts base64 encoded data and returns it as a UTF-8 string
    pub fn decrypt_string(&self, encoded_data: &str) -> Result<String> {
        let decrypted = self.decrypt(encoded_data)?;
        String::from_utf8(decrypted).map_err(|e| anyhow!("UTF-8 decode failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_with_valid_32_byte_key() {
        let key = "12345678901234567890123456789012";
        assert!(EncryptionService::new(key).is_ok());
    }

    #[test]
    fn test_new_with_invalid_key_length() {
        let result = EncryptionService::new("short");
        assert!(result.is_err());
    }

    #[test]
    fn test_encryption_decryption() {
        let key = "12345678901234567890123456789012";
        let service = EncryptionService::new(key).unwrap();

        let original = "wJalrXUtnFEMI/K7MDENG/bPxRfiCY";
        let encrypted = service.encrypt_string(original).unwrap();
        let decrypted = service.decrypt_string(&encrypted).unwrap();

        assert_eq!(original, decrypted);
    }

    #[test]
    fn test_encryption_different_each_time() {
        let service = EncryptionService::new_from_password("test_password");

        let original = "secret";
        let encrypted1 = service.encrypt_string(original).unwrap();
        let encrypted2 = service.encrypt_string(original).unwrap();

        // Random nonce per call
        assert_ne!(encrypted1, encrypted2);
        assert_eq!(service.decrypt_string(&encrypted1).unwrap(), original);
        assert_eq!(service.decrypt_string(&encrypted2).unwrap(), original);
    }

    #[test]
    fn test_decrypt_with_wrong_key() {
        let service1 = EncryptionService::new_from_password("password1");
        let service2 = EncryptionService::new_from_password("password2");

        let encrypted = service1.encrypt_string("secret").unwrap();
        assert!(service2.decrypt_string(&encrypted).is_err());
    }

    #[test]
    fn test_decrypt_invalid_base64() {
        let service = EncryptionService::new_from_password("p");
        assert!(service.decrypt_string("not-base64!").is_err());
    }

    #[test]
    fn test_decrypt_too_short_data() {
        let service = EncryptionService::new_from_password("p");
        let short = BASE64.encode(b"short");
        assert!(service.decrypt_string(&short).is_err());
    }
}
