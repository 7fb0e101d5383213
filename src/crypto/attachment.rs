//! Attachment envelope crypto (spec.md SS4.2 `fetchAttachment`, SS6
//! "Attachment envelope").
//!
//! Wire format: `[iv(16) | AES-CBC-PKCS5(content) | HMAC-SHA256(32)]`, keyed
//! by a 64-byte key material split into a 32-byte AES key and a 32-byte MAC
//! key. Unlike the signaling-key framing there is no version byte and the MAC
//! is the full 32 bytes, matching the attachment pointer's `key` field.

use crate::crypto::primitives::{aes_cbc_decrypt, aes_cbc_encrypt, constant_time_eq, hmac_sha256, random_iv};
use crate::error::{Error, Result};

pub const ATTACHMENT_KEY_LEN: usize = 64;

pub struct AttachmentCipher<'a> {
    aes_key: &'a [u8],
    mac_key: &'a [u8],
}

impl<'a> AttachmentCipher<'a> {
    pub fn new(key_material: &'a [u8]) -> Result<Self> {
        if key_material.len() != ATTACHMENT_KEY_LEN {
            return Err(Error::InvalidKey("attachment key must be 64 bytes".into()));
        }
        Ok(Self {
            aes_key: &key_material[..32],
            mac_key: &key_material[32..],
        })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let iv = random_iv();
        let ciphertext = aes_cbc_encrypt(self.aes_key, &iv, plaintext)?;

        let mut framed = Vec::with_capacity(iv.len() + ciphertext.len() + 32);
        framed.extend_from_slice(&iv);
        framed.extend_from_slice(&ciphertext);

        let mac = hmac_sha256(self.mac_key, &framed);
        framed.extend_from_slice(&mac);
        Ok(framed)
    }

    /// Decrypt a downloaded attachment blob, optionally checking the
    /// attachment pointer's `digest` (SHA-256 over the whole framed blob)
    /// before trusting the MAC-verified plaintext.
    pub fn decrypt(&self, framed: &[u8], expected_digest: Option<&[u8]>) -> Result<Vec<u8>> {
        const MIN_LEN: usize = 16 + 32;
        if framed.len() < MIN_LEN {
            return Err(Error::InvalidLength);
        }

        if let Some(expected) = expected_digest {
            use sha2::{Digest, Sha256};
            let actual = Sha256::digest(framed);
            if !constant_time_eq(&actual, expected) {
                return Err(Error::InvalidHash);
            }
        }

        let mac_offset = framed.len() - 32;
        let (signed, mac) = framed.split_at(mac_offset);

        let expected_mac = hmac_sha256(self.mac_key, signed);
        if !constant_time_eq(&expected_mac, mac) {
            return Err(Error::InvalidMac);
        }

        let iv = &framed[..16];
        let ciphertext = &framed[16..mac_offset];
        aes_cbc_decrypt(self.aes_key, iv, ciphertext).map_err(|_| Error::Decryption("attachment".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::primitives::random_bytes;

    #[test]
    fn round_trips_without_digest_check() {
        let key = random_bytes(ATTACHMENT_KEY_LEN);
        let cipher = AttachmentCipher::new(&key).unwrap();
        let plaintext = b"attachment bytes, arbitrary length content here";
        let framed = cipher.encrypt(plaintext).unwrap();
        let decrypted = cipher.decrypt(&framed, None).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn round_trips_with_correct_digest() {
        use sha2::{Digest, Sha256};

        let key = random_bytes(ATTACHMENT_KEY_LEN);
        let cipher = AttachmentCipher::new(&key).unwrap();
        let framed = cipher.encrypt(b"hello attachment").unwrap();
        let digest = Sha256::digest(&framed);
        let decrypted = cipher.decrypt(&framed, Some(&digest)).unwrap();
        assert_eq!(decrypted, b"hello attachment");
    }

    #[test]
    fn rejects_wrong_digest() {
        let key = random_bytes(ATTACHMENT_KEY_LEN);
        let cipher = AttachmentCipher::new(&key).unwrap();
        let framed = cipher.encrypt(b"hello attachment").unwrap();
        let bogus_digest = [0u8; 32];
        assert!(matches!(
            cipher.decrypt(&framed, Some(&bogus_digest)),
            Err(Error::InvalidHash)
        ));
    }

    #[test]
    fn rejects_tampered_ciphertext() {
        let key = random_bytes(ATTACHMENT_KEY_LEN);
        let cipher = AttachmentCipher::new(&key).unwrap();
        let mut framed = cipher.encrypt(b"hello attachment").unwrap();
        let mid = framed.len() / 2;
        framed[mid] ^= 0xFF;
        assert!(matches!(cipher.decrypt(&framed, None), Err(Error::InvalidMac)));
    }
}
