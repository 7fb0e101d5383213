//! Typed adapters over [`crate::store::StorageBackend`] (spec.md SS4.1 "Key
//! store"). Five logical namespaces: account scalars (identity keys,
//! registration id, signaling key, ...), prekeys, signed prekeys, sessions,
//! and trust records.

use std::sync::Arc;

use uuid::Uuid;

use crate::address::Address;
use crate::crypto::keys::{IdentityKeyPair, IdentityPublicKey, PreKey, SignedPreKey};
use crate::error::{Error, Result};
use crate::session::SessionState;
use crate::store::{namespace, StorageBackend};

const KEY_REGISTRATION_ID: &str = "registrationId";
const KEY_PRIVATE_IDENTITY: &str = "privateIdentityKey";
const KEY_PUBLIC_IDENTITY: &str = "publicIdentityKey";
const KEY_SIGNALING_KEY: &str = "signalingKey";
const KEY_ADDRESS: &str = "address";
const KEY_DEVICE_LABEL: &str = "deviceLabel";
const KEY_SERVER_URL: &str = "serverUrl";
const KEY_PASSWORD: &str = "password";
const KEY_JWT: &str = "jwt";
const KEY_IDENTITY_URL: &str = "identityUrl";

const LAST_ID_KEY: &str = "lastId";

/// Typed, namespace-aware facade over a raw [`StorageBackend`]. Cheaply
/// cloneable; all methods take `&self` since the backend itself owns its
/// interior mutability.
#[derive(Clone)]
pub struct KeyStore {
    backend: Arc<dyn StorageBackend>,
}

impl KeyStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    // -- account scalars (identity-keys namespace) --------------------------

    async fn set_string(&self, key: &str, value: &str) -> Result<()> {
        self.backend
            .set(namespace::IDENTITY_KEYS, key, value.as_bytes().to_vec())
            .await
    }

    async fn get_string(&self, key: &str) -> Result<Option<String>> {
        match self.backend.get(namespace::IDENTITY_KEYS, key).await? {
            Some(bytes) => Ok(Some(
                String::from_utf8(bytes).map_err(|e| Error::Storage(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    async fn set_u32(&self, key: &str, value: u32) -> Result<()> {
        self.backend
            .set(namespace::IDENTITY_KEYS, key, value.to_be_bytes().to_vec())
            .await
    }

    async fn get_u32(&self, key: &str) -> Result<Option<u32>> {
        match self.backend.get(namespace::IDENTITY_KEYS, key).await? {
            Some(bytes) if bytes.len() == 4 => {
                Ok(Some(u32::from_be_bytes(bytes.try_into().expect("checked length"))))
            }
            Some(_) => Err(Error::InvalidLength),
            None => Ok(None),
        }
    }

    pub async fn registration_id(&self) -> Result<Option<u32>> {
        self.get_u32(KEY_REGISTRATION_ID).await
    }

    pub async fn set_registration_id(&self, id: u32) -> Result<()> {
        self.set_u32(KEY_REGISTRATION_ID, id).await
    }

    pub async fn identity_key_pair(&self) -> Result<Option<IdentityKeyPair>> {
        match self.backend.get(namespace::IDENTITY_KEYS, KEY_PRIVATE_IDENTITY).await? {
            Some(bytes) if bytes.len() == 32 => {
                let array: [u8; 32] = bytes.try_into().expect("checked length");
                Ok(Some(IdentityKeyPair::from_private_bytes(&array)))
            }
            Some(_) => Err(Error::InvalidKey("stored identity key has wrong length".into())),
            None => Ok(None),
        }
    }

    pub async fn set_identity_key_pair(&self, identity: &IdentityKeyPair) -> Result<()> {
        self.backend
            .set(
                namespace::IDENTITY_KEYS,
                KEY_PRIVATE_IDENTITY,
                identity.private_key_bytes().to_vec(),
            )
            .await?;
        self.backend
            .set(
                namespace::IDENTITY_KEYS,
                KEY_PUBLIC_IDENTITY,
                identity.public_key().as_bytes().to_vec(),
            )
            .await
    }

    pub async fn signaling_key(&self) -> Result<Option<Vec<u8>>> {
        self.backend.get(namespace::IDENTITY_KEYS, KEY_SIGNALING_KEY).await
    }

    pub async fn set_signaling_key(&self, key: &[u8]) -> Result<()> {
        self.backend
            .set(namespace::IDENTITY_KEYS, KEY_SIGNALING_KEY, key.to_vec())
            .await
    }

    pub async fn address(&self) -> Result<Option<Address>> {
        match self.get_string(KEY_ADDRESS).await? {
            Some(s) => Ok(Some(Address::parse(&s)?)),
            None => Ok(None),
        }
    }

    pub async fn set_address(&self, address: Address) -> Result<()> {
        self.set_string(KEY_ADDRESS, &address.to_string()).await
    }

    pub async fn device_label(&self) -> Result<Option<String>> {
        self.get_string(KEY_DEVICE_LABEL).await
    }

    pub async fn set_device_label(&self, label: &str) -> Result<()> {
        self.set_string(KEY_DEVICE_LABEL, label).await
    }

    pub async fn server_url(&self) -> Result<Option<String>> {
        self.get_string(KEY_SERVER_URL).await
    }

    pub async fn set_server_url(&self, url: &str) -> Result<()> {
        self.set_string(KEY_SERVER_URL, url).await
    }

    pub async fn password(&self) -> Result<Option<String>> {
        self.get_string(KEY_PASSWORD).await
    }

    pub async fn set_password(&self, password: &str) -> Result<()> {
        self.set_string(KEY_PASSWORD, password).await
    }

    pub async fn jwt(&self) -> Result<Option<String>> {
        self.get_string(KEY_JWT).await
    }

    pub async fn set_jwt(&self, jwt: &str) -> Result<()> {
        self.set_string(KEY_JWT, jwt).await
    }

    pub async fn identity_url(&self) -> Result<Option<String>> {
        self.get_string(KEY_IDENTITY_URL).await
    }

    pub async fn set_identity_url(&self, url: &str) -> Result<()> {
        self.set_string(KEY_IDENTITY_URL, url).await
    }

    // -- prekeys --------------------------------------------------------

    pub async fn store_pre_key(&self, pre_key: &PreKey) -> Result<()> {
        self.backend
            .set(namespace::PRE_KEYS, &pre_key.id.to_string(), pre_key.serialize())
            .await
    }

    pub async fn load_pre_key(&self, id: u32) -> Result<Option<PreKey>> {
        match self.backend.get(namespace::PRE_KEYS, &id.to_string()).await? {
            Some(bytes) => Ok(Some(PreKey::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Consumed prekeys are deleted immediately (spec.md SS3: "Deleted after
    /// use").
    pub async fn remove_pre_key(&self, id: u32) -> Result<()> {
        self.backend.remove(namespace::PRE_KEYS, &id.to_string()).await
    }

    /// The next batch of ids to hand out, wrapping modulo `u32` as the
    /// namespace's `lastId` scalar overflows.
    pub async fn next_pre_key_ids(&self, count: u32) -> Result<Vec<u32>> {
        let last = self.last_id(namespace::PRE_KEYS).await?;
        let ids: Vec<u32> = (1..=count).map(|i| last.wrapping_add(i)).collect();
        self.set_last_id(namespace::PRE_KEYS, *ids.last().unwrap_or(&last)).await?;
        Ok(ids)
    }

    // -- signed prekeys ---------------------------------------------------

    pub async fn store_signed_pre_key(&self, signed_pre_key: &SignedPreKey) -> Result<()> {
        self.backend
            .set(
                namespace::SIGNED_PRE_KEYS,
                &signed_pre_key.id.to_string(),
                signed_pre_key.serialize(),
            )
            .await
    }

    pub async fn load_signed_pre_key(&self, id: u32) -> Result<Option<SignedPreKey>> {
        match self.backend.get(namespace::SIGNED_PRE_KEYS, &id.to_string()).await? {
            Some(bytes) => Ok(Some(SignedPreKey::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn next_signed_pre_key_id(&self) -> Result<u32> {
        let last = self.last_id(namespace::SIGNED_PRE_KEYS).await?;
        let next = last.wrapping_add(1);
        self.set_last_id(namespace::SIGNED_PRE_KEYS, next).await?;
        Ok(next)
    }

    async fn last_id(&self, namespace: &str) -> Result<u32> {
        match self.backend.get(namespace, LAST_ID_KEY).await? {
            Some(bytes) if bytes.len() == 4 => Ok(u32::from_be_bytes(bytes.try_into().expect("checked length"))),
            Some(_) => Err(Error::InvalidLength),
            None => Ok(0),
        }
    }

    async fn set_last_id(&self, namespace: &str, value: u32) -> Result<()> {
        self.backend.set(namespace, LAST_ID_KEY, value.to_be_bytes().to_vec()).await
    }

    // -- sessions ---------------------------------------------------------

    pub async fn store_session(&self, address: Address, state: &SessionState) -> Result<()> {
        self.backend
            .set(namespace::SESSIONS, &address.to_string(), state.serialize())
            .await
    }

    pub async fn load_session(&self, address: Address) -> Result<Option<SessionState>> {
        match self.backend.get(namespace::SESSIONS, &address.to_string()).await? {
            Some(bytes) => Ok(Some(SessionState::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn has_session(&self, address: Address) -> Result<bool> {
        self.backend.has(namespace::SESSIONS, &address.to_string()).await
    }

    pub async fn delete_session(&self, address: Address) -> Result<()> {
        self.backend.remove(namespace::SESSIONS, &address.to_string()).await
    }

    /// The peer device's registration id, captured off its prekey bundle when
    /// the session was established (spec.md SS4.2 `getKeysForAddr`); needed
    /// again on every later send as `destinationRegistrationId`.
    pub async fn store_remote_registration_id(&self, address: Address, registration_id: u32) -> Result<()> {
        self.backend
            .set(
                namespace::SESSIONS,
                &format!("{address}.registrationId"),
                registration_id.to_be_bytes().to_vec(),
            )
            .await
    }

    pub async fn load_remote_registration_id(&self, address: Address) -> Result<Option<u32>> {
        match self
            .backend
            .get(namespace::SESSIONS, &format!("{address}.registrationId"))
            .await?
        {
            Some(bytes) if bytes.len() == 4 => Ok(Some(u32::from_be_bytes(bytes.try_into().expect("checked length")))),
            Some(_) => Err(Error::InvalidLength),
            None => Ok(None),
        }
    }

    /// The X3DH header a freshly-established session owes its very next
    /// outgoing message (spec.md SS4.5 step 5, envelope type `prekeyBundle`).
    /// One-shot: consumed by [`Self::take_pending_prekey_header`].
    pub async fn store_pending_prekey_header(&self, address: Address, header_bytes: Vec<u8>) -> Result<()> {
        self.backend
            .set(namespace::SESSIONS, &format!("{address}.prekeyHeader"), header_bytes)
            .await
    }

    pub async fn take_pending_prekey_header(&self, address: Address) -> Result<Option<Vec<u8>>> {
        let key = format!("{address}.prekeyHeader");
        let header = self.backend.get(namespace::SESSIONS, &key).await?;
        if header.is_some() {
            self.backend.remove(namespace::SESSIONS, &key).await?;
        }
        Ok(header)
    }

    /// Every device of `user_id` we currently have session state for,
    /// enumerated by prefix-scanning and parsing the session namespace
    /// (spec.md SS4.1).
    pub async fn device_ids_for_user(&self, user_id: Uuid) -> Result<Vec<u32>> {
        let prefix = format!("{}.", user_id.hyphenated().to_string().to_lowercase());
        let keys = self.backend.keys_in_namespace(namespace::SESSIONS).await?;
        let mut device_ids: Vec<u32> = keys
            .iter()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter_map(|suffix| suffix.parse().ok())
            .collect();
        device_ids.sort_unstable();
        Ok(device_ids)
    }

    // -- trust records ------------------------------------------------------

    pub async fn trusted_identity(&self, address: Address) -> Result<Option<IdentityPublicKey>> {
        match self.backend.get(namespace::TRUST, &address.to_string()).await? {
            Some(bytes) if bytes.len() == 32 => {
                let array: [u8; 32] = bytes.try_into().expect("checked length");
                Ok(Some(IdentityPublicKey::from_bytes(&array)?))
            }
            Some(_) => Err(Error::InvalidKey("stored trust record has wrong length".into())),
            None => Ok(None),
        }
    }

    pub async fn set_trusted_identity(&self, address: Address, identity: &IdentityPublicKey) -> Result<()> {
        self.backend
            .set(namespace::TRUST, &address.to_string(), identity.as_bytes().to_vec())
            .await
    }

    pub async fn remove_trusted_identity(&self, address: Address) -> Result<()> {
        self.backend.remove(namespace::TRUST, &address.to_string()).await
    }

    /// Trust-on-first-use: no stored identity is trusted by default; a
    /// mismatch is untrusted and left to the caller to resolve (spec.md
    /// SS4.1).
    pub async fn is_trusted(&self, address: Address, identity: &IdentityPublicKey) -> Result<bool> {
        match self.trusted_identity(address).await? {
            None => Ok(true),
            Some(stored) => Ok(&stored == identity),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBackend;

    fn store() -> KeyStore {
        KeyStore::new(Arc::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn registration_id_round_trips() {
        let store = store();
        assert_eq!(store.registration_id().await.unwrap(), None);
        store.set_registration_id(1234).await.unwrap();
        assert_eq!(store.registration_id().await.unwrap(), Some(1234));
    }

    #[tokio::test]
    async fn identity_key_pair_round_trips() {
        let store = store();
        let identity = IdentityKeyPair::generate();
        store.set_identity_key_pair(&identity).await.unwrap();
        let loaded = store.identity_key_pair().await.unwrap().unwrap();
        assert_eq!(loaded.public_key(), identity.public_key());
    }

    #[tokio::test]
    async fn pre_key_ids_wrap_with_no_gaps() {
        let store = store();
        let first_batch = store.next_pre_key_ids(100).await.unwrap();
        assert_eq!(first_batch, (1..=100).collect::<Vec<_>>());

        let second_batch = store.next_pre_key_ids(5).await.unwrap();
        assert_eq!(second_batch, (101..=105).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn pre_key_ids_wrap_modulo_u32() {
        let store = store();
        store.set_last_id(namespace::PRE_KEYS, u32::MAX - 1).await.unwrap();
        let batch = store.next_pre_key_ids(3).await.unwrap();
        assert_eq!(batch, vec![u32::MAX, 0, 1]);
    }

    #[tokio::test]
    async fn trust_on_first_use() {
        let store = store();
        let address = Address::new(Uuid::new_v4(), 1);
        let identity = IdentityKeyPair::generate().public_key();

        assert!(store.is_trusted(address, &identity).await.unwrap());

        store.set_trusted_identity(address, &identity).await.unwrap();
        assert!(store.is_trusted(address, &identity).await.unwrap());

        let other_identity = IdentityKeyPair::generate().public_key();
        assert!(!store.is_trusted(address, &other_identity).await.unwrap());
    }

    #[tokio::test]
    async fn sessions_are_enumerable_by_user() {
        let store = store();
        let user_id = Uuid::new_v4();
        let shared_secret = [3u8; 32];

        for device_id in [1u32, 2, 3] {
            let address = Address::new(user_id, device_id);
            let ratchet_key = crate::crypto::keys::DhKeyPair::generate();
            let state = SessionState::initialize_responder(&shared_secret, ratchet_key);
            store.store_session(address, &state).await.unwrap();
        }

        let mut device_ids = store.device_ids_for_user(user_id).await.unwrap();
        device_ids.sort_unstable();
        assert_eq!(device_ids, vec![1, 2, 3]);
    }
}
