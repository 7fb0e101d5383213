//! `ForstaClient`: the facade wiring the key store, the two HTTP surfaces,
//! the message socket, and the sender/receiver/provisioning engines into one
//! object (spec.md SS4 "Module responsibilities").

use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::address::{Address, Recipient};
use crate::config::{ClientConfig, ReconnectPolicy};
use crate::crypto::attachment::AttachmentCipher;
use crate::crypto::keys::IdentityKeyPair;
use crate::error::{Error, Result};
use crate::events::{EventBus, Observer, SubscriptionToken};
use crate::keystore::KeyStore;
use crate::payload::Payload;
use crate::proto::AttachmentPointer;
use crate::provisioning::{AutoprovisionHandle, ProvisioningEngine};
use crate::receiver::MessageReceiver;
use crate::registration::{bootstrap_prekeys, random_password, random_registration_id, random_signaling_key};
use crate::sender::{MessageSender, SendOptions, TransmissionInfo};
use crate::socket::SocketResource;
use crate::store::StorageBackend;
use crate::transport::atlas_client::AtlasClient;
use crate::transport::signal_client::SignalTransportClient;

/// Top-level handle a host application holds for the lifetime of one logical
/// device (spec.md SS1 "Scope").
pub struct ForstaClient {
    config: ClientConfig,
    keystore: KeyStore,
    atlas: Arc<AtlasClient>,
    events: Arc<EventBus>,
    provisioning: ProvisioningEngine,
    transport: RwLock<Option<Arc<SignalTransportClient>>>,
    socket: RwLock<Option<Arc<SocketResource>>>,
}

impl ForstaClient {
    pub fn new(config: ClientConfig, backend: Arc<dyn StorageBackend>) -> Result<Self> {
        let keystore = KeyStore::new(backend);
        let atlas = Arc::new(AtlasClient::new(&config, config.services.atlas_url.clone())?);
        let events = Arc::new(EventBus::new());
        let provisioning = ProvisioningEngine::new(config.clone(), keystore.clone(), atlas.clone(), events.clone());

        Ok(Self {
            config,
            keystore,
            atlas,
            events,
            provisioning,
            transport: RwLock::new(None),
            socket: RwLock::new(None),
        })
    }

    /// Set the JWT used to authenticate against Atlas. Required before
    /// [`Self::register_account`] or [`Self::autoprovision`].
    pub fn set_atlas_jwt(&self, jwt: impl Into<String>) {
        self.atlas.set_jwt(jwt);
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn subscribe(&self, observer: &Arc<dyn Observer>) -> SubscriptionToken {
        self.events.subscribe(observer)
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) {
        self.events.unsubscribe(token);
    }

    /// Our own address once registered/provisioned, if any.
    pub async fn address(&self) -> Result<Option<Address>> {
        self.keystore.address().await
    }

    /// `registerAccount` (spec.md SS4.2): ask Atlas to create a fresh
    /// account on its chosen relay, generate a full set of credentials, and
    /// upload an initial prekey bundle.
    pub async fn register_account(&self) -> Result<Address> {
        let provisioned = self.atlas.provision_account(&self.config.device_label).await?;
        let address = Address::new(provisioned.user_id, provisioned.device_id);

        let identity = IdentityKeyPair::generate();
        self.keystore.set_identity_key_pair(&identity).await?;
        self.keystore.set_registration_id(random_registration_id()).await?;
        self.keystore.set_signaling_key(&random_signaling_key()).await?;
        let password = random_password();
        self.keystore.set_password(&password).await?;
        self.keystore.set_address(address).await?;
        self.keystore.set_server_url(&provisioned.server_url).await?;

        let transport = Arc::new(SignalTransportClient::new(
            &self.config,
            provisioned.server_url.clone(),
            address,
            password,
        )?);
        bootstrap_prekeys(&self.config, &self.keystore, &transport, &identity).await?;
        *self.transport.write().await = Some(transport);

        tracing::info!(%address, "registered a new account");
        Ok(address)
    }

    /// New-device role of the provisioning engine (spec.md SS4.7). On
    /// success the new credentials are persisted to the key store; call
    /// [`Self::use_existing_registration`] afterwards to install the
    /// transport before [`Self::connect`] or [`Self::send`].
    pub async fn autoprovision(&self) -> Result<AutoprovisionHandle> {
        self.provisioning.begin_autoprovision().await
    }

    /// Install the transport for an address this client already holds full
    /// credentials for, e.g. after [`AutoprovisionHandle::join`] resolves or
    /// on a cold start loading a previously-persisted identity.
    pub async fn use_existing_registration(&self) -> Result<Address> {
        let address = self
            .keystore
            .address()
            .await?
            .ok_or_else(|| Error::Configuration("device is not registered".into()))?;
        let password = self
            .keystore
            .password()
            .await?
            .ok_or_else(|| Error::Configuration("missing relay password".into()))?;
        let server_url = self
            .keystore
            .server_url()
            .await?
            .unwrap_or_else(|| self.config.services.signal_url.clone());

        let transport = Arc::new(SignalTransportClient::new(&self.config, server_url, address, password)?);
        *self.transport.write().await = Some(transport);
        Ok(address)
    }

    /// Primary-device role of the provisioning engine (spec.md SS4.7
    /// `linkDevice`), answering a `provisionRequest` control payload naming
    /// `uuid` and the new device's ephemeral public key.
    pub async fn link_device(&self, uuid: Uuid, their_ephemeral_public_key: &x25519_dalek::PublicKey) -> Result<bool> {
        let transport = self.require_transport().await?;
        self.provisioning.link_device(&transport, uuid, their_ephemeral_public_key).await
    }

    /// Open the persistent message socket and start dispatching inbound
    /// envelopes as [`crate::events::Event`]s (spec.md SS4.3, SS4.6).
    pub async fn connect(&self) -> Result<()> {
        let address = self
            .keystore
            .address()
            .await?
            .ok_or_else(|| Error::Configuration("device is not registered".into()))?;
        let password = self
            .keystore
            .password()
            .await?
            .ok_or_else(|| Error::Configuration("missing relay password".into()))?;

        let login = format!("{}.{}", address.user_id, address.device_id);
        let socket_url = format!(
            "{}/v1/websocket/?login={}&password={}",
            self.config.services.signal_websocket_url,
            urlencoding::encode(&login),
            urlencoding::encode(&password),
        );

        let socket = SocketResource::new(socket_url, ReconnectPolicy::default(), self.events.clone());
        socket.set_request_handler(Arc::new(MessageReceiver::new(self.keystore.clone(), self.events.clone())));
        socket.connect().await?;
        *self.socket.write().await = Some(socket);
        tracing::info!(%address, "message socket connected");
        Ok(())
    }

    pub async fn disconnect(&self) {
        if let Some(socket) = self.socket.write().await.take() {
            socket.disconnect();
            tracing::info!("message socket disconnected");
        }
    }

    /// `send` (spec.md SS4.5): encrypt `payload` per-device and deliver to
    /// every recipient, syncing to our other devices per `options`.
    pub async fn send(&self, payload: &Payload, recipients: &[Recipient], options: SendOptions) -> Result<Vec<TransmissionInfo>> {
        let transport = self.require_transport().await?;
        let sender = MessageSender::new(self.config.clone(), self.keystore.clone(), transport, self.events.clone());
        sender.send(payload, recipients, options).await
    }

    /// `fetchAttachment` (spec.md SS4.2): resolve the signed download URL,
    /// fetch the ciphertext, then decrypt/verify it under the pointer's key
    /// and digest.
    pub async fn fetch_attachment(&self, attachment: &AttachmentPointer) -> Result<Vec<u8>> {
        let transport = self.require_transport().await?;
        let id = attachment
            .id
            .as_deref()
            .ok_or_else(|| Error::InvalidPayload("attachment pointer missing id".into()))?;
        let key = attachment
            .key
            .as_deref()
            .ok_or_else(|| Error::InvalidPayload("attachment pointer missing key".into()))?;

        let signed_url = transport.attachment_download_url(id).await?;
        let framed = transport.fetch_attachment_ciphertext(&signed_url).await?;

        let cipher = AttachmentCipher::new(key)?;
        cipher.decrypt(&framed, attachment.digest.as_deref())
    }

    async fn require_transport(&self) -> Result<Arc<SignalTransportClient>> {
        self.transport
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::Configuration("no active transport; call register_account/autoprovision/use_existing_registration first".into()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::events::Event;
    use crate::store::MemoryBackend;

    fn client() -> ForstaClient {
        ForstaClient::new(ClientConfig::default(), Arc::new(MemoryBackend::new())).unwrap()
    }

    #[tokio::test]
    async fn fresh_client_has_no_address() {
        let client = client();
        assert_eq!(client.address().await.unwrap(), None);
    }

    #[tokio::test]
    async fn operations_require_a_transport_before_registration() {
        let client = client();
        let payload = crate::payload::Payload::new(crate::payload::MessageType::Content, Uuid::new_v4(), "@a");
        let err = client.send(&payload, &[], SendOptions::new()).await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn use_existing_registration_requires_stored_credentials() {
        let client = client();
        let err = client.use_existing_registration().await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn use_existing_registration_installs_transport_from_stored_credentials() {
        let client = client();
        let address = Address::new(Uuid::new_v4(), 1);
        client.keystore.set_address(address).await.unwrap();
        client.keystore.set_password("pw").await.unwrap();

        let resolved = client.use_existing_registration().await.unwrap();
        assert_eq!(resolved, address);
        assert!(client.transport.read().await.is_some());
    }

    #[tokio::test]
    async fn link_device_requires_a_transport() {
        let client = client();
        let uuid = Uuid::new_v4();
        let ephemeral = crate::crypto::keys::DhKeyPair::generate();
        let err = client.link_device(uuid, ephemeral.public_key()).await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn connect_requires_prior_registration() {
        let client = client();
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn disconnect_without_a_socket_is_a_no_op() {
        let client = client();
        client.disconnect().await;
    }

    #[tokio::test]
    async fn subscribers_receive_events_published_on_the_shared_bus() {
        struct CountingObserver {
            count: Arc<AtomicUsize>,
        }
        impl Observer for CountingObserver {
            fn on_event(&self, _event: &Event) {
                self.count.fetch_add(1, Ordering::SeqCst);
            }
        }

        let client = client();
        let count = Arc::new(AtomicUsize::new(0));
        let observer: Arc<dyn Observer> = Arc::new(CountingObserver { count: count.clone() });
        let token = client.subscribe(&observer);

        client.events().notify(Event::QueueEmpty);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        client.unsubscribe(token);
        client.events().notify(Event::QueueEmpty);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
