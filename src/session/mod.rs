//! The abstract session cipher boundary the rest of the crate depends on
//! (spec.md SS1: "the underlying Signal double-ratchet primitives ... are
//! treated as an external collaborator"). [`SessionCipher`] is that boundary;
//! [`DoubleRatchetCipher`] is the one concrete implementation this crate
//! ships, built from X3DH + the Double Ratchet.

pub mod ratchet;
pub mod x3dh;

use async_trait::async_trait;
use x25519_dalek::PublicKey as X25519PublicKey;

use crate::address::Address;
use crate::crypto::keys::{DhKeyPair, IdentityKeyPair, IdentityPublicKey, PreKeyBundle};
use crate::error::{Error, Result};
pub use ratchet::SessionState;
use ratchet::RatchetMessage;

/// Everything the sender/receiver need from a session: encrypt an outgoing
/// plaintext, decrypt an incoming ciphertext. Implementations own whatever
/// session state that requires; callers never reach into ratchet internals.
#[async_trait]
pub trait SessionCipher: Send + Sync {
    async fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>>;
    async fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// Wraps a [`SessionState`] behind the `SessionCipher` trait, serializing
/// ratchet messages to bytes on the wire.
pub struct DoubleRatchetCipher {
    state: SessionState,
}

impl DoubleRatchetCipher {
    pub fn from_state(state: SessionState) -> Self {
        Self { state }
    }

    pub fn into_state(self) -> SessionState {
        self.state
    }

    pub fn serialize_state(&self) -> Vec<u8> {
        self.state.serialize()
    }
}

#[async_trait]
impl SessionCipher for DoubleRatchetCipher {
    async fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        Ok(self.state.encrypt(plaintext)?.serialize())
    }

    async fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let message = RatchetMessage::deserialize(ciphertext)?;
        self.state.decrypt(&message)
    }
}

/// Bundles everything the initiator needs to hand to a peer: the serialized
/// first ratchet message, plus the X3DH fields that go in the outer prekey
/// envelope so the peer can independently derive the same shared secret.
pub struct InitialSession {
    pub cipher: DoubleRatchetCipher,
    pub our_identity_key: IdentityPublicKey,
    pub our_ephemeral_key: X25519PublicKey,
    pub used_pre_key_id: Option<u32>,
    pub used_signed_pre_key_id: u32,
}

/// Alice's side: establish a brand new session against Bob's prekey bundle.
pub fn initiate_session(our_identity_key: &IdentityKeyPair, their_bundle: &PreKeyBundle) -> Result<InitialSession> {
    let x3dh_result = x3dh::initiate(our_identity_key, their_bundle)?;
    let ratchet_key = DhKeyPair::generate();
    let state = SessionState::initialize_initiator(
        &x3dh_result.shared_secret,
        ratchet_key,
        &their_bundle.signed_pre_key_public,
    )?;

    Ok(InitialSession {
        cipher: DoubleRatchetCipher { state },
        our_identity_key: our_identity_key.public_key(),
        our_ephemeral_key: x3dh_result.ephemeral_public_key,
        used_pre_key_id: x3dh_result.used_pre_key_id,
        used_signed_pre_key_id: their_bundle.signed_pre_key_id,
    })
}

/// Bob's side: establish a session from Alice's identity/ephemeral key and
/// the local signed/one-time prekey she claims to have used.
pub fn accept_session(
    our_identity_key: &IdentityKeyPair,
    our_signed_pre_key: &DhKeyPair,
    our_one_time_pre_key: Option<&DhKeyPair>,
    their_identity_key: &IdentityPublicKey,
    their_ephemeral_key: &X25519PublicKey,
) -> Result<DoubleRatchetCipher> {
    let shared_secret = x3dh::respond(
        our_identity_key,
        our_signed_pre_key,
        our_one_time_pre_key,
        their_identity_key,
        their_ephemeral_key,
    )?;
    let state = SessionState::initialize_responder(&shared_secret, DhKeyPair::from_private_bytes(our_signed_pre_key.private_key_bytes()));
    Ok(DoubleRatchetCipher { state })
}

/// Looked up by `Address` to route a message to the right per-device ratchet
/// state; kept here (rather than in `keystore`) since it's purely a runtime
/// cache, not something that's persisted as-is.
pub fn no_session_error(address: Address) -> Error {
    Error::NoSession(address)
}

const PREKEY_HEADER_VERSION: u8 = 3;

/// The X3DH fields a first message to a brand-new session must carry inline,
/// since the envelope framing only has room for opaque `content` bytes
/// (spec.md SS3 "Envelope", SS4.5 step 5: envelope type `prekeyBundle`).
#[derive(Clone, Debug)]
pub struct PreKeySignalHeader {
    pub identity_key: IdentityPublicKey,
    pub ephemeral_key: X25519PublicKey,
    pub pre_key_id: Option<u32>,
    pub signed_pre_key_id: u32,
}

impl PreKeySignalHeader {
    /// Everything but the ratchet message itself; stashed in the key store
    /// between session establishment and the first `encrypt` call so the
    /// sender can prepend it to exactly one outgoing message.
    pub fn header_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(70);
        data.push(PREKEY_HEADER_VERSION);
        data.extend_from_slice(&self.identity_key.as_bytes());
        data.extend_from_slice(self.ephemeral_key.as_bytes());

        if let Some(id) = self.pre_key_id {
            data.push(1);
            data.extend_from_slice(&id.to_be_bytes());
        } else {
            data.push(0);
        }
        data.extend_from_slice(&self.signed_pre_key_id.to_be_bytes());
        data
    }

    /// Prepend this header to an already-serialized ratchet message.
    pub fn wrap(&self, ratchet_message: &[u8]) -> Vec<u8> {
        Self::wrap_header_bytes(&self.header_bytes(), ratchet_message)
    }

    /// Same as [`Self::wrap`] but starting from previously-stashed
    /// [`Self::header_bytes`], so a sender doesn't need to reconstruct the
    /// typed header just to attach it to a message.
    pub fn wrap_header_bytes(header_bytes: &[u8], ratchet_message: &[u8]) -> Vec<u8> {
        let mut data = Vec::with_capacity(header_bytes.len() + 4 + ratchet_message.len());
        data.extend_from_slice(header_bytes);
        data.extend_from_slice(&(ratchet_message.len() as u32).to_be_bytes());
        data.extend_from_slice(ratchet_message);
        data
    }

    /// Split a wrapped message back into its header and the ratchet message
    /// bytes it carries.
    pub fn unwrap(data: &[u8]) -> Result<(Self, &[u8])> {
        if data.len() < 70 {
            return Err(Error::InvalidLength);
        }
        if data[0] != PREKEY_HEADER_VERSION {
            return Err(Error::InvalidType(format!("unsupported prekey message version {}", data[0])));
        }

        let identity_bytes: [u8; 32] = data[1..33].try_into().expect("checked length");
        let identity_key = IdentityPublicKey::from_bytes(&identity_bytes)?;

        let ephemeral_bytes: [u8; 32] = data[33..65].try_into().expect("checked length");
        let ephemeral_key = X25519PublicKey::from(ephemeral_bytes);

        let has_pre_key = data[65] == 1;
        let mut offset = 66;

        let pre_key_id = if has_pre_key {
            let id = u32::from_be_bytes(data[offset..offset + 4].try_into().map_err(|_| Error::InvalidLength)?);
            offset += 4;
            Some(id)
        } else {
            None
        };
        if data.len() < offset + 4 {
            return Err(Error::InvalidLength);
        }
        let signed_pre_key_id = u32::from_be_bytes(data[offset..offset + 4].try_into().map_err(|_| Error::InvalidLength)?);
        offset += 4;

        if data.len() < offset + 4 {
            return Err(Error::InvalidLength);
        }
        let msg_len = u32::from_be_bytes(data[offset..offset + 4].try_into().map_err(|_| Error::InvalidLength)?) as usize;
        offset += 4;

        if data.len() < offset + msg_len {
            return Err(Error::InvalidLength);
        }

        Ok((
            Self {
                identity_key,
                ephemeral_key,
                pre_key_id,
                signed_pre_key_id,
            },
            &data[offset..offset + msg_len],
        ))
    }
}

#[cfg(test)]
mod prekey_header_tests {
    use super::*;
    use crate::crypto::keys::DhKeyPair;

    #[test]
    fn wrap_unwrap_round_trips_with_one_time_prekey() {
        let identity = IdentityKeyPair::generate().public_key();
        let ephemeral = DhKeyPair::generate();
        let header = PreKeySignalHeader {
            identity_key: identity.clone(),
            ephemeral_key: *ephemeral.public_key(),
            pre_key_id: Some(7),
            signed_pre_key_id: 3,
        };

        let wrapped = header.wrap(b"ratchet message bytes");
        let (parsed, message) = PreKeySignalHeader::unwrap(&wrapped).unwrap();
        assert_eq!(parsed.identity_key, identity);
        assert_eq!(parsed.pre_key_id, Some(7));
        assert_eq!(parsed.signed_pre_key_id, 3);
        assert_eq!(message, b"ratchet message bytes");
    }

    #[test]
    fn wrap_unwrap_round_trips_without_one_time_prekey() {
        let identity = IdentityKeyPair::generate().public_key();
        let ephemeral = DhKeyPair::generate();
        let header = PreKeySignalHeader {
            identity_key: identity,
            ephemeral_key: *ephemeral.public_key(),
            pre_key_id: None,
            signed_pre_key_id: 9,
        };

        let wrapped = header.wrap(b"hi");
        let (parsed, message) = PreKeySignalHeader::unwrap(&wrapped).unwrap();
        assert_eq!(parsed.pre_key_id, None);
        assert_eq!(message, b"hi");
    }
}
