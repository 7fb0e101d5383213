//! Prekey bootstrap shared by fresh registration and autoprovisioning
//! (spec.md SS4.2 `registerAccount`, SS4.7: "upload prekeys as at fresh
//! registration").

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;

use crate::config::ClientConfig;
use crate::crypto::keys::{IdentityKeyPair, SignedPreKey};
use crate::crypto::primitives::random_bytes;
use crate::crypto::signaling::SIGNALING_KEY_LEN;
use crate::error::Result;
use crate::keystore::KeyStore;
use crate::transport::signal_client::SignalTransportClient;

/// A fresh 14-bit registration id, advertised in prekey bundles and compared
/// against on every delivery (spec.md SS3 "Registration id").
pub fn random_registration_id() -> u32 {
    rand::rngs::OsRng.next_u32() % 16384
}

/// A fresh relay account password, negotiated once at registration/
/// provisioning time and reused for HTTP Basic auth thereafter (spec.md SS4.2).
pub fn random_password() -> String {
    BASE64.encode(random_bytes(24))
}

/// A fresh signaling key: 32 bytes AES key concatenated with 20 bytes MAC key
/// (spec.md SS2, SS6).
pub fn random_signaling_key() -> Vec<u8> {
    random_bytes(SIGNALING_KEY_LEN)
}

/// Generate a fresh batch of unsigned prekeys plus one signed prekey, persist
/// them, and upload the whole bundle (along with the identity public key) to
/// the relay. Idempotent: re-invocation replaces all key material, which
/// invalidates any peer session still referencing the old signed prekey.
pub async fn bootstrap_prekeys(
    config: &ClientConfig,
    keystore: &KeyStore,
    transport: &SignalTransportClient,
    identity: &IdentityKeyPair,
) -> Result<()> {
    let pre_key_ids = keystore.next_pre_key_ids(config.prekey_batch_size).await?;
    let mut pre_keys = Vec::with_capacity(pre_key_ids.len());
    for id in pre_key_ids {
        let pre_key = crate::crypto::keys::PreKey::generate(id);
        keystore.store_pre_key(&pre_key).await?;
        pre_keys.push(pre_key);
    }

    let signed_pre_key_id = keystore.next_signed_pre_key_id().await?;
    let signed_pre_key = SignedPreKey::generate(signed_pre_key_id, identity);
    keystore.store_signed_pre_key(&signed_pre_key).await?;

    transport.upload_keys(&identity.public_key(), &pre_keys, &signed_pre_key).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_id_is_fourteen_bits() {
        for _ in 0..256 {
            assert!(random_registration_id() < 16384);
        }
    }

    #[test]
    fn password_decodes_to_twenty_four_bytes() {
        let password = random_password();
        let decoded = BASE64.decode(password).unwrap();
        assert_eq!(decoded.len(), 24);
    }

    #[test]
    fn signaling_key_has_signaling_key_length() {
        assert_eq!(random_signaling_key().len(), SIGNALING_KEY_LEN);
    }

    #[test]
    fn successive_passwords_differ() {
        assert_ne!(random_password(), random_password());
    }
}
