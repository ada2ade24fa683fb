// MIT License - Copyright (c) 2021 TJForc

use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use md5::{Digest, Md5};
use tracing::debug;

use crate::constants::DISCOVERY_KEY_SEED;
use crate::error::{BridgeError, Result};

const BLOCK_SIZE: usize = 16;

/// AES-128-ECB cipher keyed with a device's local key.
///
/// Payloads are padded with PKCS#7 before encryption, so ciphertext is
/// always a whole number of blocks.
#[derive(Clone)]
pub struct LocalCipher {
    cipher: Aes128,
    key: [u8; BLOCK_SIZE],
}

impl std::fmt::Debug for LocalCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCipher").finish_non_exhaustive()
    }
}

impl LocalCipher {
    /// Create a cipher from a raw 16-byte key.
    pub fn new(key: &[u8]) -> Result<Self> {
        let key: [u8; BLOCK_SIZE] = key.try_into().map_err(|_| BridgeError::BadKey {
            details: format!("expected {} bytes, got {}", BLOCK_SIZE, key.len()),
        })?;
        let cipher = Aes128::new_from_slice(&key).map_err(|e| BridgeError::BadKey {
            details: e.to_string(),
        })?;
        Ok(Self { cipher, key })
    }

    /// Create a cipher from the ASCII local key stored in device configuration.
    pub fn from_local_key(local_key: &str) -> Result<Self> {
        Self::new(local_key.as_bytes())
    }

    /// Cipher used for encrypted UDP discovery broadcasts.
    pub fn discovery() -> Result<Self> {
        let key = Md5::digest(DISCOVERY_KEY_SEED);
        Self::new(key.as_slice())
    }

    /// The raw key bytes (used by the V1 auth fragment).
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let pad = BLOCK_SIZE - plaintext.len() % BLOCK_SIZE;
        let mut buf = Vec::with_capacity(plaintext.len() + pad);
        buf.extend_from_slice(plaintext);
        buf.resize(plaintext.len() + pad, pad as u8);

        for block in buf.chunks_exact_mut(BLOCK_SIZE) {
            self.cipher.encrypt_block(GenericArray::from_mut_slice(block));
        }
        buf
    }

    /// Decrypt and strip PKCS#7 padding.
    ///
    /// Fails with `InvalidPayload` when the ciphertext is not block aligned
    /// or the padding is malformed, which usually means the key is wrong.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
            return Err(BridgeError::InvalidPayload {
                details: format!("ciphertext length {} is not block aligned", ciphertext.len()),
            });
        }

        let mut buf = ciphertext.to_vec();
        for block in buf.chunks_exact_mut(BLOCK_SIZE) {
            self.cipher.decrypt_block(GenericArray::from_mut_slice(block));
        }

        let pad = buf[buf.len() - 1] as usize;
        if pad == 0 || pad > BLOCK_SIZE || buf[buf.len() - pad..].iter().any(|&b| b as usize != pad) {
            debug!("Bad PKCS#7 padding after decrypt (pad byte {})", pad);
            return Err(BridgeError::InvalidPayload {
                details: "bad padding, wrong local key?".to_string(),
            });
        }
        buf.truncate(buf.len() - pad);
        Ok(buf)
    }
}

/// Lowercase hex MD5 digest.
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// CRC32 (IEEE) of a byte slice.
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0123456789abcdef";

    #[test]
    fn test_rejects_short_key() {
        let err = LocalCipher::from_local_key("short").unwrap_err();
        assert!(matches!(err, BridgeError::BadKey { .. }));
    }

    #[test]
    fn test_encrypt_pads_to_block() {
        let cipher = LocalCipher::from_local_key(KEY).unwrap();
        assert_eq!(cipher.encrypt(b"").len(), 16);
        assert_eq!(cipher.encrypt(b"{\"dps\":{}}").len(), 16);
        // A full block still gets a whole padding block
        assert_eq!(cipher.encrypt(&[0x41; 16]).len(), 32);
    }

    #[test]
    fn test_decrypt_restores_plaintext() {
        let cipher = LocalCipher::from_local_key(KEY).unwrap();
        let plain = br#"{"devId":"bf01","dps":{"1":true}}"#;
        let encrypted = cipher.encrypt(plain);
        assert_ne!(&encrypted[..plain.len().min(encrypted.len())], &plain[..]);
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), plain.to_vec());
    }

    #[test]
    fn test_decrypt_with_wrong_key_fails_cleanly() {
        let a = LocalCipher::from_local_key(KEY).unwrap();
        let b = LocalCipher::from_local_key("fedcba9876543210").unwrap();
        let encrypted = a.encrypt(b"{\"dps\":{\"1\":1}}");
        // Either bad padding or garbage; never a panic
        if let Ok(out) = b.decrypt(&encrypted) {
            assert_ne!(out, b"{\"dps\":{\"1\":1}}".to_vec());
        }
    }

    #[test]
    fn test_decrypt_rejects_unaligned() {
        let cipher = LocalCipher::from_local_key(KEY).unwrap();
        assert!(cipher.decrypt(&[1, 2, 3]).is_err());
        assert!(cipher.decrypt(&[]).is_err());
    }

    #[test]
    fn test_md5_hex_known_vector() {
        assert_eq!(md5_hex(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(md5_hex(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn test_crc32_check_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn test_discovery_cipher_builds() {
        let cipher = LocalCipher::discovery().unwrap();
        assert_eq!(cipher.key().len(), 16);
    }
}
