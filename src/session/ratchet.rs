//! Double Ratchet session state (spec.md SS1 abstract session cipher
//! boundary). One concrete implementation so the crate is runnable
//! end-to-end; callers that want a different ratchet only need to implement
//! [`crate::session::SessionCipher`].

use std::collections::HashMap;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use chrono::Utc;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use x25519_dalek::PublicKey as X25519PublicKey;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::keys::DhKeyPair;
use crate::error::{Error, Result};

const NONCE_SIZE: usize = 12;
const MAX_SKIP: u32 = 1000;

fn derive_root_key(root_key: &[u8; 32], dh_output: &[u8; 32]) -> Result<([u8; 32], [u8; 32])> {
    let hk = Hkdf::<Sha256>::new(Some(root_key), dh_output);
    let mut output = [0u8; 64];
    hk.expand(b"WhisperRatchet", &mut output)
        .map_err(|_| Error::Encryption("root key HKDF expand failed".into()))?;
    let mut new_root_key = [0u8; 32];
    let mut chain_key = [0u8; 32];
    new_root_key.copy_from_slice(&output[..32]);
    chain_key.copy_from_slice(&output[32..]);
    Ok((new_root_key, chain_key))
}

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct MessageKeys {
    cipher_key: [u8; 32],
    #[zeroize(skip)]
    iv: [u8; 16],
    next_chain_key: [u8; 32],
}

fn derive_message_keys(chain_key: &[u8; 32]) -> Result<MessageKeys> {
    let mut mac = Hmac::<Sha256>::new_from_slice(chain_key).expect("HMAC accepts any key length");
    mac.update(&[0x02]);
    let mut next_chain_key = [0u8; 32];
    next_chain_key.copy_from_slice(&mac.finalize().into_bytes());

    let mut mac = Hmac::<Sha256>::new_from_slice(chain_key).expect("HMAC accepts any key length");
    mac.update(&[0x01]);
    let message_key_material = mac.finalize().into_bytes();

    let hk = Hkdf::<Sha256>::new(Some(b""), &message_key_material);
    let mut expanded = [0u8; 48];
    hk.expand(b"WhisperMessageKeys", &mut expanded)
        .map_err(|_| Error::Encryption("message key HKDF expand failed".into()))?;

    let mut cipher_key = [0u8; 32];
    let mut iv = [0u8; 16];
    cipher_key.copy_from_slice(&expanded[..32]);
    iv.copy_from_slice(&expanded[32..48]);

    Ok(MessageKeys {
        cipher_key,
        iv,
        next_chain_key,
    })
}

fn gcm_encrypt(key: &[u8; 32], nonce: &[u8; NONCE_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| Error::Encryption("bad GCM key".into()))?;
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| Error::Encryption("GCM seal failed".into()))
}

fn gcm_decrypt(key: &[u8; 32], nonce: &[u8; NONCE_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| Error::Decryption("bad GCM key".into()))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::Decryption("GCM open failed".into()))
}

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct SkippedKey {
    cipher_key: [u8; 32],
    #[zeroize(skip)]
    iv: [u8; 16],
    #[zeroize(skip)]
    timestamp_ms: i64,
}

/// Per-peer ratchet state: root key, sending/receiving chains, and enough
/// skipped-key bookkeeping to handle out-of-order delivery.
pub struct SessionState {
    dh_self: DhKeyPair,
    dh_remote: Option<X25519PublicKey>,
    root_key: [u8; 32],
    sending_chain_key: Option<[u8; 32]>,
    receiving_chain_key: Option<[u8; 32]>,
    sending_counter: u32,
    receiving_counter: u32,
    previous_counter: u32,
    skipped_keys: HashMap<(Vec<u8>, u32), SkippedKey>,
}

impl SessionState {
    /// Alice's side, called right after X3DH.
    pub fn initialize_initiator(
        shared_secret: &[u8; 32],
        our_ratchet_key: DhKeyPair,
        their_ratchet_key: &X25519PublicKey,
    ) -> Result<Self> {
        let dh_output = our_ratchet_key.dh_agreement(their_ratchet_key);
        let (new_root_key, sending_chain_key) = derive_root_key(shared_secret, &dh_output)?;

        Ok(Self {
            dh_self: our_ratchet_key,
            dh_remote: Some(*their_ratchet_key),
            root_key: new_root_key,
            sending_chain_key: Some(sending_chain_key),
            receiving_chain_key: None,
            sending_counter: 0,
            receiving_counter: 0,
            previous_counter: 0,
            skipped_keys: HashMap::new(),
        })
    }

    /// Bob's side, called on receiving Alice's first message.
    pub fn initialize_responder(shared_secret: &[u8; 32], our_ratchet_key: DhKeyPair) -> Self {
        Self {
            dh_self: our_ratchet_key,
            dh_remote: None,
            root_key: *shared_secret,
            sending_chain_key: None,
            receiving_chain_key: None,
            sending_counter: 0,
            receiving_counter: 0,
            previous_counter: 0,
            skipped_keys: HashMap::new(),
        }
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<RatchetMessage> {
        let chain_key = self
            .sending_chain_key
            .ok_or_else(|| Error::Encryption("no sending chain key".into()))?;
        let message_keys = derive_message_keys(&chain_key)?;
        self.sending_chain_key = Some(message_keys.next_chain_key);

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&message_keys.iv[..NONCE_SIZE]);
        let ciphertext = gcm_encrypt(&message_keys.cipher_key, &nonce, plaintext)?;

        let header = MessageHeader {
            dh_ratchet_key: *self.dh_self.public_key(),
            previous_counter: self.previous_counter,
            message_counter: self.sending_counter,
        };
        self.sending_counter += 1;

        Ok(RatchetMessage { header, ciphertext })
    }

    pub fn decrypt(&mut self, message: &RatchetMessage) -> Result<Vec<u8>> {
        let key_id = (
            message.header.dh_ratchet_key.as_bytes().to_vec(),
            message.header.message_counter,
        );

        if let Some(skipped) = self.skipped_keys.remove(&key_id) {
            let mut nonce = [0u8; NONCE_SIZE];
            nonce.copy_from_slice(&skipped.iv[..NONCE_SIZE]);
            return gcm_decrypt(&skipped.cipher_key, &nonce, &message.ciphertext);
        }

        let their_key = message.header.dh_ratchet_key;
        if self.dh_remote != Some(their_key) {
            if self.receiving_chain_key.is_some() {
                self.skip_message_keys(message.header.previous_counter)?;
            }
            self.dh_ratchet(&their_key)?;
        }

        self.skip_message_keys(message.header.message_counter)?;

        let chain_key = self
            .receiving_chain_key
            .ok_or_else(|| Error::Decryption("no receiving chain key".into()))?;
        let message_keys = derive_message_keys(&chain_key)?;
        self.receiving_chain_key = Some(message_keys.next_chain_key);
        self.receiving_counter = message.header.message_counter + 1;

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&message_keys.iv[..NONCE_SIZE]);
        gcm_decrypt(&message_keys.cipher_key, &nonce, &message.ciphertext)
    }

    fn dh_ratchet(&mut self, their_key: &X25519PublicKey) -> Result<()> {
        self.previous_counter = self.sending_counter;
        self.sending_counter = 0;
        self.receiving_counter = 0;
        self.dh_remote = Some(*their_key);

        let dh_output = self.dh_self.dh_agreement(their_key);
        let (new_root_key, receiving_chain_key) = derive_root_key(&self.root_key, &dh_output)?;
        self.root_key = new_root_key;
        self.receiving_chain_key = Some(receiving_chain_key);

        self.dh_self = DhKeyPair::generate();

        let dh_output = self.dh_self.dh_agreement(their_key);
        let (new_root_key, sending_chain_key) = derive_root_key(&self.root_key, &dh_output)?;
        self.root_key = new_root_key;
        self.sending_chain_key = Some(sending_chain_key);

        Ok(())
    }

    fn skip_message_keys(&mut self, until: u32) -> Result<()> {
        if self.receiving_chain_key.is_none() {
            return Ok(());
        }

        let current = self.receiving_counter;
        if until < current {
            return Ok(());
        }
        if until - current > MAX_SKIP {
            return Err(Error::Decryption("too many skipped messages".into()));
        }

        let Some(dh_key) = self.dh_remote.map(|k| k.as_bytes().to_vec()) else {
            return Ok(());
        };

        for i in current..until {
            let chain_key = self.receiving_chain_key.expect("checked above");
            let message_keys = derive_message_keys(&chain_key)?;

            self.skipped_keys.insert(
                (dh_key.clone(), i),
                SkippedKey {
                    cipher_key: message_keys.cipher_key,
                    iv: message_keys.iv,
                    timestamp_ms: Utc::now().timestamp_millis(),
                },
            );
            self.receiving_chain_key = Some(message_keys.next_chain_key);
        }

        Ok(())
    }

    pub fn our_ratchet_key(&self) -> &X25519PublicKey {
        self.dh_self.public_key()
    }

    /// Drop skipped keys older than `max_age_ms`, bounding the unbounded
    /// growth a peer that never catches up would otherwise cause.
    pub fn cleanup_skipped_keys(&mut self, max_age_ms: i64) {
        let now = Utc::now().timestamp_millis();
        self.skipped_keys.retain(|_, key| now - key.timestamp_ms < max_age_ms);
    }

    /// Serialize session state for persistence in the key store's `Sessions`
    /// namespace (spec.md SS6 "Persisted state layout").
    pub fn serialize(&self) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&self.dh_self.private_key_bytes());

        match self.dh_remote {
            Some(key) => {
                data.push(1);
                data.extend_from_slice(key.as_bytes());
            }
            None => data.push(0),
        }

        data.extend_from_slice(&self.root_key);

        for chain in [self.sending_chain_key, self.receiving_chain_key] {
            match chain {
                Some(key) => {
                    data.push(1);
                    data.extend_from_slice(&key);
                }
                None => data.push(0),
            }
        }

        data.extend_from_slice(&self.sending_counter.to_be_bytes());
        data.extend_from_slice(&self.receiving_counter.to_be_bytes());
        data.extend_from_slice(&self.previous_counter.to_be_bytes());

        data.extend_from_slice(&(self.skipped_keys.len() as u32).to_be_bytes());
        for ((dh_key, counter), skipped) in &self.skipped_keys {
            data.extend_from_slice(&(dh_key.len() as u32).to_be_bytes());
            data.extend_from_slice(dh_key);
            data.extend_from_slice(&counter.to_be_bytes());
            data.extend_from_slice(&skipped.cipher_key);
            data.extend_from_slice(&skipped.iv);
            data.extend_from_slice(&skipped.timestamp_ms.to_be_bytes());
        }

        data
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);

        let dh_self = DhKeyPair::from_private_bytes(cursor.take_array()?);

        let dh_remote = if cursor.take_u8()? == 1 {
            Some(X25519PublicKey::from(cursor.take_array()?))
        } else {
            None
        };

        let root_key = cursor.take_array()?;

        let sending_chain_key = if cursor.take_u8()? == 1 {
            Some(cursor.take_array()?)
        } else {
            None
        };
        let receiving_chain_key = if cursor.take_u8()? == 1 {
            Some(cursor.take_array()?)
        } else {
            None
        };

        let sending_counter = cursor.take_u32()?;
        let receiving_counter = cursor.take_u32()?;
        let previous_counter = cursor.take_u32()?;

        let skipped_count = cursor.take_u32()?;
        let mut skipped_keys = HashMap::with_capacity(skipped_count as usize);
        for _ in 0..skipped_count {
            let dh_key_len = cursor.take_u32()? as usize;
            let dh_key = cursor.take_vec(dh_key_len)?;
            let counter = cursor.take_u32()?;
            let cipher_key = cursor.take_array()?;
            let iv = cursor.take_array()?;
            let timestamp_ms = i64::from_be_bytes(cursor.take_array()?);

            skipped_keys.insert(
                (dh_key, counter),
                SkippedKey {
                    cipher_key,
                    iv,
                    timestamp_ms,
                },
            );
        }

        Ok(Self {
            dh_self,
            dh_remote,
            root_key,
            sending_chain_key,
            receiving_chain_key,
            sending_counter,
            receiving_counter,
            previous_counter,
            skipped_keys,
        })
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.offset + len > self.data.len() {
            return Err(Error::InvalidLength);
        }
        let slice = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn take_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    fn take_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        Ok(self.take(len)?.to_vec())
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.take(N)?.try_into().map_err(|_| Error::InvalidLength)
    }
}

/// Per-message ratchet header: which DH key the sender was on, and where in
/// its chains.
#[derive(Clone, Debug)]
pub struct MessageHeader {
    pub dh_ratchet_key: X25519PublicKey,
    pub previous_counter: u32,
    pub message_counter: u32,
}

impl MessageHeader {
    pub fn serialize(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(40);
        data.extend_from_slice(self.dh_ratchet_key.as_bytes());
        data.extend_from_slice(&self.previous_counter.to_be_bytes());
        data.extend_from_slice(&self.message_counter.to_be_bytes());
        data
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < 40 {
            return Err(Error::InvalidLength);
        }
        let key_bytes: [u8; 32] = data[0..32].try_into().expect("checked length");
        let dh_ratchet_key = X25519PublicKey::from(key_bytes);
        let previous_counter = u32::from_be_bytes(data[32..36].try_into().expect("checked length"));
        let message_counter = u32::from_be_bytes(data[36..40].try_into().expect("checked length"));

        Ok(Self {
            dh_ratchet_key,
            previous_counter,
            message_counter,
        })
    }
}

#[derive(Clone, Debug)]
pub struct RatchetMessage {
    pub header: MessageHeader,
    pub ciphertext: Vec<u8>,
}

impl RatchetMessage {
    pub fn serialize(&self) -> Vec<u8> {
        let header = self.header.serialize();
        let mut data = Vec::with_capacity(4 + header.len() + self.ciphertext.len());
        data.extend_from_slice(&(header.len() as u32).to_be_bytes());
        data.extend_from_slice(&header);
        data.extend_from_slice(&self.ciphertext);
        data
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::InvalidLength);
        }
        let header_len = u32::from_be_bytes(data[0..4].try_into().expect("checked length")) as usize;
        if data.len() < 4 + header_len {
            return Err(Error::InvalidLength);
        }
        let header = MessageHeader::deserialize(&data[4..4 + header_len])?;
        let ciphertext = data[4 + header_len..].to_vec();

        Ok(Self { header, ciphertext })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn establish_pair() -> (SessionState, SessionState) {
        let shared_secret = [7u8; 32];
        let bob_ratchet = DhKeyPair::generate();
        let bob_public = *bob_ratchet.public_key();

        let alice = SessionState::initialize_initiator(&shared_secret, DhKeyPair::generate(), &bob_public).unwrap();
        let bob = SessionState::initialize_responder(&shared_secret, bob_ratchet);
        (alice, bob)
    }

    #[test]
    fn first_message_round_trips() {
        let (mut alice, mut bob) = establish_pair();
        let message = alice.encrypt(b"hello bob").unwrap();
        let plaintext = bob.decrypt(&message).unwrap();
        assert_eq!(plaintext, b"hello bob");
    }

    #[test]
    fn ratchets_back_and_forth_across_several_messages() {
        let (mut alice, mut bob) = establish_pair();

        let m1 = alice.encrypt(b"first").unwrap();
        assert_eq!(bob.decrypt(&m1).unwrap(), b"first");

        let m2 = bob.encrypt(b"reply").unwrap();
        assert_eq!(alice.decrypt(&m2).unwrap(), b"reply");

        let m3 = alice.encrypt(b"second").unwrap();
        assert_eq!(bob.decrypt(&m3).unwrap(), b"second");
    }

    #[test]
    fn handles_out_of_order_delivery_within_one_chain() {
        let (mut alice, mut bob) = establish_pair();

        let m1 = alice.encrypt(b"one").unwrap();
        let m2 = alice.encrypt(b"two").unwrap();
        let m3 = alice.encrypt(b"three").unwrap();

        assert_eq!(bob.decrypt(&m3).unwrap(), b"three");
        assert_eq!(bob.decrypt(&m1).unwrap(), b"one");
        assert_eq!(bob.decrypt(&m2).unwrap(), b"two");
    }

    #[test]
    fn session_state_serialization_round_trips() {
        let (mut alice, mut bob) = establish_pair();
        let m1 = alice.encrypt(b"one").unwrap();
        let m2 = alice.encrypt(b"two").unwrap();
        bob.decrypt(&m2).unwrap();

        let bytes = bob.serialize();
        let mut restored = SessionState::deserialize(&bytes).unwrap();

        assert_eq!(restored.decrypt(&m1).unwrap(), b"one");
    }

    #[test]
    fn message_serialization_round_trips() {
        let (mut alice, _bob) = establish_pair();
        let message = alice.encrypt(b"serialize me").unwrap();
        let bytes = message.serialize();
        let restored = RatchetMessage::deserialize(&bytes).unwrap();
        assert_eq!(restored.header.message_counter, message.header.message_counter);
        assert_eq!(restored.ciphertext, message.ciphertext);
    }
}
