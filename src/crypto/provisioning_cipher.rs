//! `ProvisioningCipher`: the ephemeral-key-based envelope used to transfer a
//! long-term identity key from an existing device to a new one (spec.md
//! SS4.7).
//!
//! Wire format: `[0x01 | iv(16) | AES-CBC-PKCS5(content) | HMAC-SHA256(full
//! 32)]`. Keys are HKDF-expanded from an ECDH shared secret between the
//! caller's ephemeral key and the peer's public key (salt = 32 zero bytes,
//! info = `"TextSecure Provisioning Message"`).

use x25519_dalek::PublicKey as X25519PublicKey;

use crate::crypto::keys::DhKeyPair;
use crate::crypto::primitives::{aes_cbc_decrypt, aes_cbc_encrypt, constant_time_eq, hkdf_expand, hmac_sha256, random_iv};
use crate::error::{Error, Result};

const VERSION: u8 = 1;
const INFO: &[u8] = b"TextSecure Provisioning Message";
const SALT: [u8; 32] = [0u8; 32];

struct DerivedKeys {
    aes_key: [u8; 32],
    mac_key: [u8; 32],
}

fn derive_keys(shared_secret: &[u8; 32]) -> Result<DerivedKeys> {
    let okm = hkdf_expand(shared_secret, &SALT, INFO, 64)?;
    let mut aes_key = [0u8; 32];
    let mut mac_key = [0u8; 32];
    aes_key.copy_from_slice(&okm[..32]);
    mac_key.copy_from_slice(&okm[32..]);
    Ok(DerivedKeys { aes_key, mac_key })
}

/// Encrypt `plaintext` (the provisioning protobuf) to `their_public_key`.
/// Returns the assembled envelope plus the ephemeral public key we generated
/// so the caller can report it alongside the encrypted body.
pub fn encrypt(their_public_key: &X25519PublicKey, plaintext: &[u8]) -> Result<(Vec<u8>, X25519PublicKey)> {
    let ephemeral = DhKeyPair::generate();
    let shared_secret = ephemeral.dh_agreement(their_public_key);
    let keys = derive_keys(&shared_secret)?;

    let iv = random_iv();
    let ciphertext = aes_cbc_encrypt(&keys.aes_key, &iv, plaintext)?;

    let mut body = Vec::with_capacity(1 + 16 + ciphertext.len() + 32);
    body.push(VERSION);
    body.extend_from_slice(&iv);
    body.extend_from_slice(&ciphertext);

    let mac = hmac_sha256(&keys.mac_key, &body);
    body.extend_from_slice(&mac);

    Ok((body, *ephemeral.public_key()))
}

/// Decrypt a provisioning envelope received on `our_ephemeral` using the
/// peer's public key to recompute the shared secret.
pub fn decrypt(our_ephemeral: &DhKeyPair, their_public_key: &X25519PublicKey, message: &[u8]) -> Result<Vec<u8>> {
    if message.len() < 1 + 16 + 32 {
        return Err(Error::InvalidLength);
    }
    if message[0] != VERSION {
        return Err(Error::InvalidType(format!("unexpected provisioning version {}", message[0])));
    }

    let mac_offset = message.len() - 32;
    let (signed, mac) = message.split_at(mac_offset);
    let iv = &message[1..17];
    let ciphertext = &message[17..mac_offset];

    let shared_secret = our_ephemeral.dh_agreement(their_public_key);
    let keys = derive_keys(&shared_secret)?;

    let expected_mac = hmac_sha256(&keys.mac_key, signed);
    if !constant_time_eq(&expected_mac, mac) {
        return Err(Error::InvalidMac);
    }

    aes_cbc_decrypt(&keys.aes_key, iv, ciphertext).map_err(|_| Error::Decryption("provisioning envelope".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_between_two_ephemeral_pairs() {
        let new_device = DhKeyPair::generate();
        let plaintext = b"identityKeyPrivate+addr+code, serialized";

        let (body, primary_ephemeral) = encrypt(new_device.public_key(), plaintext).unwrap();

        let decrypted = decrypt(&new_device, &primary_ephemeral, &body).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn rejects_tampered_body() {
        let new_device = DhKeyPair::generate();
        let (mut body, primary_ephemeral) = encrypt(new_device.public_key(), b"hello").unwrap();
        let last = body.len() - 1;
        body[last] ^= 0xFF;
        assert!(matches!(
            decrypt(&new_device, &primary_ephemeral, &body),
            Err(Error::InvalidMac)
        ));
    }

    #[quickcheck_macros::quickcheck]
    fn arbitrary_plaintext_round_trips(plaintext: Vec<u8>) -> bool {
        let new_device = DhKeyPair::generate();
        let (body, primary_ephemeral) = match encrypt(new_device.public_key(), &plaintext) {
            Ok(v) => v,
            Err(_) => return false,
        };
        decrypt(&new_device, &primary_ephemeral, &body)
            .map(|d| d == plaintext)
            .unwrap_or(false)
    }
}
