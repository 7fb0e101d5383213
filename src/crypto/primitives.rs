//! Low-level cryptographic primitives shared by the signaling-key, attachment
//! and provisioning ciphers: AES-CBC/CTR, HMAC-SHA256, HKDF, and random bytes
//! (spec.md SS2 "Crypto primitives").

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::error::{Error, Result};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

pub const AES_KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;
pub const MAC_LEN: usize = 32;

/// Fill `buf` with cryptographically random bytes.
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}

pub fn random_iv() -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    iv
}

/// AES-256-CBC encrypt with PKCS#7 padding.
pub fn aes_cbc_encrypt(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    if key.len() != AES_KEY_LEN || iv.len() != IV_LEN {
        return Err(Error::InvalidKey("AES-CBC key/iv must be 32/16 bytes".into()));
    }
    let encryptor = Aes256CbcEnc::new(key.into(), iv.into());
    Ok(encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

/// AES-256-CBC decrypt with PKCS#7 padding.
pub fn aes_cbc_decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if key.len() != AES_KEY_LEN || iv.len() != IV_LEN {
        return Err(Error::InvalidKey("AES-CBC key/iv must be 32/16 bytes".into()));
    }
    let decryptor = Aes256CbcDec::new(key.into(), iv.into());
    decryptor
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| Error::Decryption("AES-CBC padding invalid".into()))
}

/// AES-256-CTR keystream application (used for call-signalling-style
/// encryption per spec.md SS9 Open Questions; symmetric, so one function
/// serves both directions).
pub fn aes_ctr_apply(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    if key.len() != AES_KEY_LEN || iv.len() != IV_LEN {
        return Err(Error::InvalidKey("AES-CTR key/iv must be 32/16 bytes".into()));
    }
    let mut cipher = Aes256Ctr::new(key.into(), iv.into());
    let mut buf = data.to_vec();
    cipher.apply_keystream(&mut buf);
    Ok(buf)
}

/// Full 32-byte HMAC-SHA256.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// HMAC-SHA256 truncated to `len` bytes, used for the inbound socket
/// envelope framing (spec.md SS6: truncated to 10 bytes).
pub fn hmac_sha256_truncated(key: &[u8], data: &[u8], len: usize) -> Vec<u8> {
    let full = hmac_sha256(key, data);
    full[..len].to_vec()
}

/// Constant-time comparison, used to verify MACs without leaking timing
/// information about where the first mismatched byte is.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// HKDF-SHA256 expand into `output_len` bytes.
pub fn hkdf_expand(ikm: &[u8], salt: &[u8], info: &[u8], output_len: usize) -> Result<Vec<u8>> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = vec![0u8; output_len];
    hk.expand(info, &mut okm)
        .map_err(|_| Error::Encryption("HKDF expand failed".into()))?;
    Ok(okm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cbc_round_trips() {
        let key = random_bytes(AES_KEY_LEN);
        let iv = random_iv();
        let plaintext = b"a message that is not a multiple of the block size!";
        let ciphertext = aes_cbc_encrypt(&key, &iv, plaintext).unwrap();
        let decrypted = aes_cbc_decrypt(&key, &iv, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn ctr_round_trips_via_reapplication() {
        let key = random_bytes(AES_KEY_LEN);
        let iv = random_iv();
        let plaintext = b"call signalling payload";
        let ciphertext = aes_ctr_apply(&key, &iv, plaintext).unwrap();
        let decrypted = aes_ctr_apply(&key, &iv, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn hmac_truncation_is_a_prefix_of_the_full_mac() {
        let key = b"key";
        let data = b"data";
        let full = hmac_sha256(key, data);
        let truncated = hmac_sha256_truncated(key, data, 10);
        assert_eq!(&full[..10], truncated.as_slice());
    }

    #[test]
    fn constant_time_eq_matches_direct_comparison() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
