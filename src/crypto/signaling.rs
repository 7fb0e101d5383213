//! Signaling-key framing for inbound socket envelopes (spec.md SS3 "Signaling
//! key", SS4.6, SS6 "Envelope framing over the socket").
//!
//! Wire format: `[version(1) | iv(16) | AES-CBC-PKCS5(content) |
//! HMAC-SHA256_trunc10]`. The 52-byte signaling key is `32-byte AES key ||
//! 20-byte HMAC key`, negotiated with the relay at registration time.

use crate::crypto::primitives::{aes_cbc_decrypt, aes_cbc_encrypt, constant_time_eq, hmac_sha256_truncated, random_iv};
use crate::error::{Error, Result};

pub const SIGNALING_KEY_LEN: usize = 52;
const VERSION: u8 = 1;
const MAC_TRUNC_LEN: usize = 10;

pub struct SignalingKeyCipher<'a> {
    aes_key: &'a [u8],
    mac_key: &'a [u8],
}

impl<'a> SignalingKeyCipher<'a> {
    pub fn new(signaling_key: &'a [u8]) -> Result<Self> {
        if signaling_key.len() != SIGNALING_KEY_LEN {
            return Err(Error::InvalidKey("signaling key must be 52 bytes".into()));
        }
        Ok(Self {
            aes_key: &signaling_key[..32],
            mac_key: &signaling_key[32..],
        })
    }

    pub fn encrypt(&self, content: &[u8]) -> Result<Vec<u8>> {
        let iv = random_iv();
        let ciphertext = aes_cbc_encrypt(self.aes_key, &iv, content)?;

        let mut framed = Vec::with_capacity(1 + iv.len() + ciphertext.len() + MAC_TRUNC_LEN);
        framed.push(VERSION);
        framed.extend_from_slice(&iv);
        framed.extend_from_slice(&ciphertext);

        let mac = hmac_sha256_truncated(self.mac_key, &framed, MAC_TRUNC_LEN);
        framed.extend_from_slice(&mac);
        Ok(framed)
    }

    /// Validate framing, verify the MAC, and decrypt. Matches spec.md SS4.6
    /// step 2 exactly: reject malformed framing with a `400`-flavored error,
    /// anything MAC/crypto-related maps to `invalidMac`/`decryptionError`.
    pub fn decrypt(&self, framed: &[u8]) -> Result<Vec<u8>> {
        const MIN_LEN: usize = 1 + 16 + MAC_TRUNC_LEN;
        if framed.len() < MIN_LEN {
            return Err(Error::InvalidLength);
        }
        if framed[0] != VERSION {
            return Err(Error::InvalidType(format!("unexpected framing version {}", framed[0])));
        }

        let mac_offset = framed.len() - MAC_TRUNC_LEN;
        let (signed, mac) = framed.split_at(mac_offset);

        let expected_mac = hmac_sha256_truncated(self.mac_key, signed, MAC_TRUNC_LEN);
        if !constant_time_eq(&expected_mac, mac) {
            return Err(Error::InvalidMac);
        }

        let iv = &framed[1..17];
        let ciphertext = &framed[17..mac_offset];
        aes_cbc_decrypt(self.aes_key, iv, ciphertext).map_err(|_| Error::Decryption("signaling frame".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::primitives::random_bytes;

    #[test]
    fn round_trips() {
        let key = random_bytes(SIGNALING_KEY_LEN);
        let cipher = SignalingKeyCipher::new(&key).unwrap();
        let plaintext = b"an envelope protobuf blob";
        let framed = cipher.encrypt(plaintext).unwrap();
        assert_eq!(framed[0], VERSION);
        let decrypted = cipher.decrypt(&framed).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn rejects_wrong_version_byte() {
        let key = random_bytes(SIGNALING_KEY_LEN);
        let cipher = SignalingKeyCipher::new(&key).unwrap();
        let mut framed = cipher.encrypt(b"hi").unwrap();
        framed[0] = 2;
        assert!(matches!(cipher.decrypt(&framed), Err(Error::InvalidType(_))));
    }

    #[test]
    fn rejects_tampered_ciphertext() {
        let key = random_bytes(SIGNALING_KEY_LEN);
        let cipher = SignalingKeyCipher::new(&key).unwrap();
        let mut framed = cipher.encrypt(b"hi").unwrap();
        let last = framed.len() - 1;
        framed[last] ^= 0xFF;
        assert!(matches!(cipher.decrypt(&framed), Err(Error::InvalidMac)));
    }

    #[test]
    fn rejects_too_short_frames() {
        let key = random_bytes(SIGNALING_KEY_LEN);
        let cipher = SignalingKeyCipher::new(&key).unwrap();
        assert!(matches!(cipher.decrypt(&[1, 2, 3]), Err(Error::InvalidLength)));
    }
}
