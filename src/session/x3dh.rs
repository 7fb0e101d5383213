//! X3DH key agreement, establishing the initial shared secret a session is
//! ratcheted from (spec.md SS1 abstract session cipher boundary, SS3 "Key
//! store" prekey bundle fields).

use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::PublicKey as X25519PublicKey;

use crate::crypto::keys::{DhKeyPair, IdentityKeyPair, IdentityPublicKey, PreKeyBundle};
use crate::error::{Error, Result};

pub struct X3dhResult {
    pub shared_secret: [u8; 32],
    pub ephemeral_public_key: X25519PublicKey,
    pub used_pre_key_id: Option<u32>,
}

/// Alice's side: consume Bob's prekey bundle, producing a shared secret and
/// the ephemeral key she must send along with her first message.
pub fn initiate(our_identity_key: &IdentityKeyPair, their_bundle: &PreKeyBundle) -> Result<X3dhResult> {
    their_bundle.verify_signature()?;

    let ephemeral_key = DhKeyPair::generate();

    let their_identity_dh = their_bundle.identity_key.as_dh_public_key();

    // DH1 = DH(IK_A, SPK_B), DH2 = DH(EK_A, IK_B), DH3 = DH(EK_A, SPK_B),
    // DH4 = DH(EK_A, OPK_B) when a one-time prekey was available.
    let dh1 = our_identity_key.dh_agreement(&their_bundle.signed_pre_key_public);
    let dh2 = ephemeral_key.dh_agreement(&their_identity_dh);
    let dh3 = ephemeral_key.dh_agreement(&their_bundle.signed_pre_key_public);

    let mut dh_concat = Vec::with_capacity(128);
    dh_concat.extend_from_slice(&[0xFFu8; 32]);
    dh_concat.extend_from_slice(&dh1);
    dh_concat.extend_from_slice(&dh2);
    dh_concat.extend_from_slice(&dh3);

    let used_pre_key_id = if let Some(opk) = &their_bundle.pre_key_public {
        let dh4 = ephemeral_key.dh_agreement(opk);
        dh_concat.extend_from_slice(&dh4);
        their_bundle.pre_key_id
    } else {
        None
    };

    let shared_secret = kdf(&dh_concat)?;

    Ok(X3dhResult {
        shared_secret,
        ephemeral_public_key: *ephemeral_key.public_key(),
        used_pre_key_id,
    })
}

/// Bob's side: given Alice's identity key and ephemeral key, recompute the
/// same shared secret using our own long-term/signed/one-time key material.
pub fn respond(
    our_identity_key: &IdentityKeyPair,
    our_signed_pre_key: &DhKeyPair,
    our_one_time_pre_key: Option<&DhKeyPair>,
    their_identity_key: &IdentityPublicKey,
    their_ephemeral_key: &X25519PublicKey,
) -> Result<[u8; 32]> {
    let their_identity_dh = their_identity_key.as_dh_public_key();

    let dh1 = our_signed_pre_key.dh_agreement(&their_identity_dh);
    let dh2 = our_identity_key.dh_agreement(their_ephemeral_key);
    let dh3 = our_signed_pre_key.dh_agreement(their_ephemeral_key);

    let mut dh_concat = Vec::with_capacity(128);
    dh_concat.extend_from_slice(&[0xFFu8; 32]);
    dh_concat.extend_from_slice(&dh1);
    dh_concat.extend_from_slice(&dh2);
    dh_concat.extend_from_slice(&dh3);

    if let Some(opk) = our_one_time_pre_key {
        let dh4 = opk.dh_agreement(their_ephemeral_key);
        dh_concat.extend_from_slice(&dh4);
    }

    kdf(&dh_concat)
}

fn kdf(input: &[u8]) -> Result<[u8; 32]> {
    let salt = [0u8; 32];
    let hk = Hkdf::<Sha256>::new(Some(&salt), input);
    let mut output = [0u8; 32];
    hk.expand(b"X3DH", &mut output)
        .map_err(|_| Error::Encryption("X3DH HKDF expand failed".into()))?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::{PreKey, SignedPreKey};

    #[test]
    fn alice_and_bob_derive_the_same_shared_secret() {
        let alice_identity = IdentityKeyPair::generate();
        let bob_identity = IdentityKeyPair::generate();
        let bob_signed_pre_key = SignedPreKey::generate(1, &bob_identity);
        let bob_one_time_pre_key = PreKey::generate(7);

        let bob_bundle = PreKeyBundle {
            registration_id: 12345,
            device_id: 1,
            pre_key_id: Some(bob_one_time_pre_key.id),
            pre_key_public: Some(*bob_one_time_pre_key.key_pair.public_key()),
            signed_pre_key_id: bob_signed_pre_key.id,
            signed_pre_key_public: *bob_signed_pre_key.key_pair.public_key(),
            signed_pre_key_signature: bob_signed_pre_key.signature,
            identity_key: bob_identity.public_key(),
        };

        let alice_result = initiate(&alice_identity, &bob_bundle).unwrap();

        let bob_shared_secret = respond(
            &bob_identity,
            &bob_signed_pre_key.key_pair,
            Some(&bob_one_time_pre_key.key_pair),
            &alice_identity.public_key(),
            &alice_result.ephemeral_public_key,
        )
        .unwrap();

        assert_eq!(alice_result.shared_secret, bob_shared_secret);
        assert_eq!(alice_result.used_pre_key_id, Some(7));
    }

    #[test]
    fn rejects_bundle_with_bad_signature() {
        let alice_identity = IdentityKeyPair::generate();
        let bob_identity = IdentityKeyPair::generate();
        let bob_signed_pre_key = SignedPreKey::generate(1, &bob_identity);

        let mut bundle = PreKeyBundle {
            registration_id: 1,
            device_id: 1,
            pre_key_id: None,
            pre_key_public: None,
            signed_pre_key_id: bob_signed_pre_key.id,
            signed_pre_key_public: *bob_signed_pre_key.key_pair.public_key(),
            signed_pre_key_signature: bob_signed_pre_key.signature,
            identity_key: bob_identity.public_key(),
        };
        bundle.signed_pre_key_signature[0] ^= 0xFF;

        assert!(initiate(&alice_identity, &bundle).is_err());
    }
}
