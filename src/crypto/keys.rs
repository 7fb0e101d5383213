//! Identity keys, prekeys, signed prekeys and prekey bundles (spec.md SS3).
//!
//! The identity key pair is a Curve25519 keypair used two ways, mirroring
//! the teacher's approach: as an Ed25519 signing key (to sign the advertised
//! signed prekey) and, via a deterministic Edwards→Montgomery-style
//! derivation, as an X25519 key for session establishment. One 32-byte seed,
//! one canonical public key.

use chrono::Utc;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha512};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::ZeroizeOnDrop;

use crate::error::{Error, Result};

pub const SIGNATURE_LEN: usize = 64;

#[derive(Clone, ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    #[zeroize(skip)]
    signing_key: SigningKey,
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_private_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn public_key(&self) -> IdentityPublicKey {
        IdentityPublicKey {
            verifying_key: self.signing_key.verifying_key(),
        }
    }

    pub fn private_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing_key.sign(message).to_bytes()
    }

    fn dh_secret(&self) -> StaticSecret {
        let hash = Sha512::digest(self.signing_key.to_bytes());
        let mut scalar = [0u8; 32];
        scalar.copy_from_slice(&hash[..32]);
        scalar[0] &= 248;
        scalar[31] &= 127;
        scalar[31] |= 64;
        StaticSecret::from(scalar)
    }

    pub fn dh_agreement(&self, peer_public: &X25519PublicKey) -> [u8; 32] {
        *self.dh_secret().diffie_hellman(peer_public).as_bytes()
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public_key", &hex::encode(self.public_key().as_bytes()))
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityPublicKey {
    verifying_key: VerifyingKey,
}

impl IdentityPublicKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self> {
        let verifying_key =
            VerifyingKey::from_bytes(bytes).map_err(|_| Error::InvalidKey("bad identity key".into()))?;
        Ok(Self { verifying_key })
    }

    pub fn as_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    pub fn verify(&self, message: &[u8], signature: &[u8; SIGNATURE_LEN]) -> Result<()> {
        let sig = Signature::from_bytes(signature);
        self.verifying_key
            .verify(message, &sig)
            .map_err(|_| Error::InvalidSignature)
    }

    /// Edwards→Montgomery point conversion so an identity public key (used
    /// for Ed25519-style signature verification) can also serve as an X25519
    /// DH public key in X3DH. The teacher's `x3dh.rs` documents this exact
    /// simplification; real Signal achieves the same dual-use with XEdDSA.
    pub fn as_dh_public_key(&self) -> X25519PublicKey {
        use curve25519_dalek::edwards::CompressedEdwardsY;

        let bytes = self.as_bytes();
        if let Some(edwards) = CompressedEdwardsY(bytes).decompress() {
            X25519PublicKey::from(edwards.to_montgomery().to_bytes())
        } else {
            let mut hasher = Sha512::new();
            hasher.update(b"forsta-identity-to-x25519-fallback");
            hasher.update(bytes);
            let hash = hasher.finalize();
            let mut key_bytes = [0u8; 32];
            key_bytes.copy_from_slice(&hash[..32]);
            X25519PublicKey::from(key_bytes)
        }
    }
}

/// X25519 key pair used for prekeys, signed prekeys and per-session ratchet
/// keys.
#[derive(ZeroizeOnDrop)]
pub struct DhKeyPair {
    #[zeroize(skip)]
    secret: StaticSecret,
    #[zeroize(skip)]
    public: X25519PublicKey,
}

impl DhKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn from_private_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> &X25519PublicKey {
        &self.public
    }

    pub fn private_key_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    pub fn dh_agreement(&self, peer_public: &X25519PublicKey) -> [u8; 32] {
        *self.secret.diffie_hellman(peer_public).as_bytes()
    }
}

impl Clone for DhKeyPair {
    fn clone(&self) -> Self {
        Self::from_private_bytes(self.secret.to_bytes())
    }
}

impl std::fmt::Debug for DhKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhKeyPair")
            .field("public_key", &hex::encode(self.public.as_bytes()))
            .finish()
    }
}

/// An unsigned, single-use prekey. Deleted from the store once a peer
/// consumes it (spec.md SS3).
#[derive(Clone)]
pub struct PreKey {
    pub id: u32,
    pub key_pair: DhKeyPair,
}

impl PreKey {
    pub fn generate(id: u32) -> Self {
        Self {
            id,
            key_pair: DhKeyPair::generate(),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(4 + 32);
        data.extend_from_slice(&self.id.to_be_bytes());
        data.extend_from_slice(&self.key_pair.private_key_bytes());
        data
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < 36 {
            return Err(Error::InvalidLength);
        }
        let id = u32::from_be_bytes(data[0..4].try_into().unwrap());
        let private: [u8; 32] = data[4..36].try_into().unwrap();
        Ok(Self {
            id,
            key_pair: DhKeyPair::from_private_bytes(private),
        })
    }
}

/// A signed prekey, rotated periodically; the most recent one is always
/// advertised (spec.md SS3).
pub struct SignedPreKey {
    pub id: u32,
    pub key_pair: DhKeyPair,
    pub signature: [u8; SIGNATURE_LEN],
    pub timestamp: i64,
}

impl SignedPreKey {
    pub fn generate(id: u32, identity_key: &IdentityKeyPair) -> Self {
        let key_pair = DhKeyPair::generate();
        let signature = identity_key.sign(key_pair.public_key().as_bytes());
        Self {
            id,
            key_pair,
            signature,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(4 + 32 + 64 + 8);
        data.extend_from_slice(&self.id.to_be_bytes());
        data.extend_from_slice(&self.key_pair.private_key_bytes());
        data.extend_from_slice(&self.signature);
        data.extend_from_slice(&self.timestamp.to_be_bytes());
        data
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < 4 + 32 + 64 + 8 {
            return Err(Error::InvalidLength);
        }
        let id = u32::from_be_bytes(data[0..4].try_into().unwrap());
        let private: [u8; 32] = data[4..36].try_into().unwrap();
        let signature: [u8; 64] = data[36..100].try_into().unwrap();
        let timestamp = i64::from_be_bytes(data[100..108].try_into().unwrap());
        Ok(Self {
            id,
            key_pair: DhKeyPair::from_private_bytes(private),
            signature,
            timestamp,
        })
    }
}

/// The asymmetric material a peer uploads so others can bootstrap a session
/// without interaction (spec.md SS4.2 `getKeysForAddr`).
#[derive(Clone, Debug)]
pub struct PreKeyBundle {
    pub registration_id: u32,
    pub device_id: u32,
    pub pre_key_id: Option<u32>,
    pub pre_key_public: Option<X25519PublicKey>,
    pub signed_pre_key_id: u32,
    pub signed_pre_key_public: X25519PublicKey,
    pub signed_pre_key_signature: [u8; SIGNATURE_LEN],
    pub identity_key: IdentityPublicKey,
}

impl PreKeyBundle {
    pub fn verify_signature(&self) -> Result<()> {
        self.identity_key
            .verify(self.signed_pre_key_public.as_bytes(), &self.signed_pre_key_signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signs_and_verifies() {
        let identity = IdentityKeyPair::generate();
        let message = b"signed prekey public bytes";
        let sig = identity.sign(message);
        assert!(identity.public_key().verify(message, &sig).is_ok());
    }

    #[test]
    fn dh_agreement_is_symmetric() {
        let alice = DhKeyPair::generate();
        let bob = DhKeyPair::generate();
        assert_eq!(
            alice.dh_agreement(bob.public_key()),
            bob.dh_agreement(alice.public_key())
        );
    }

    #[test]
    fn prekey_round_trips_through_serialization() {
        let pre_key = PreKey::generate(42);
        let bytes = pre_key.serialize();
        let restored = PreKey::deserialize(&bytes).unwrap();
        assert_eq!(pre_key.id, restored.id);
        assert_eq!(
            pre_key.key_pair.private_key_bytes(),
            restored.key_pair.private_key_bytes()
        );
    }

    #[test]
    fn signed_prekey_bundle_verifies() {
        let identity = IdentityKeyPair::generate();
        let spk = SignedPreKey::generate(1, &identity);
        let bundle = PreKeyBundle {
            registration_id: 1234,
            device_id: 1,
            pre_key_id: None,
            pre_key_public: None,
            signed_pre_key_id: spk.id,
            signed_pre_key_public: *spk.key_pair.public_key(),
            signed_pre_key_signature: spk.signature,
            identity_key: identity.public_key(),
        };
        assert!(bundle.verify_signature().is_ok());
    }
}
