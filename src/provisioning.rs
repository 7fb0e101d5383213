//! Ephemeral-key-based transfer of a long-term identity key from an existing
//! ("primary") device to a new device (spec.md SS4.7 "Provisioning engine").
//!
//! Two roles share the `ProvisioningCipher` primitive (`crypto::provisioning_cipher`):
//! the new device opens the provisioning socket and waits for an envelope;
//! a primary device answers that request out-of-band, as a `linkDevice`
//! call triggered by a provisioning-request control payload.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use prost::Message as _;
use tokio::sync::oneshot;
use uuid::Uuid;
use x25519_dalek::PublicKey as X25519PublicKey;

use crate::address::Address;
use crate::config::{ClientConfig, ReconnectPolicy};
use crate::crypto::keys::{DhKeyPair, IdentityKeyPair};
use crate::crypto::provisioning_cipher;
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::keystore::KeyStore;
use crate::proto::{ProvisionMessage, ProvisioningEnvelope, ProvisioningUuid};
use crate::registration::{bootstrap_prekeys, random_password, random_registration_id, random_signaling_key};
use crate::socket::{RequestHandler, SocketResource};
use crate::transport::atlas_client::AtlasClient;
use crate::transport::signal_client::SignalTransportClient;

type WaiterResult = Result<(X25519PublicKey, Vec<u8>)>;

#[derive(Clone)]
pub struct ProvisioningEngine {
    config: ClientConfig,
    keystore: KeyStore,
    atlas: Arc<AtlasClient>,
    events: Arc<EventBus>,
}

impl ProvisioningEngine {
    pub fn new(config: ClientConfig, keystore: KeyStore, atlas: Arc<AtlasClient>, events: Arc<EventBus>) -> Self {
        Self {
            config,
            keystore,
            atlas,
            events,
        }
    }

    /// New-device role: open the provisioning socket and start waiting for a
    /// primary device to answer. Returns immediately with a handle; await
    /// [`AutoprovisionHandle::join`] for the resulting address, or call
    /// [`AutoprovisionHandle::cancel`] to give up.
    pub async fn begin_autoprovision(&self) -> Result<AutoprovisionHandle> {
        let ephemeral = DhKeyPair::generate();
        let (envelope_tx, envelope_rx) = oneshot::channel::<WaiterResult>();
        let waiter = Arc::new(Mutex::new(Some(envelope_tx)));

        let handler = Arc::new(AutoprovisionHandler {
            atlas: self.atlas.clone(),
            our_ephemeral_public: *ephemeral.public_key(),
            waiter: waiter.clone(),
        });

        let socket_url = format!("{}/v1/websocket/provisioning/", self.config.services.signal_websocket_url);
        let socket = SocketResource::new(socket_url, ReconnectPolicy::default(), self.events.clone());
        socket.set_request_handler(handler);
        socket.connect().await?;

        let (result_tx, result_rx) = oneshot::channel();
        let engine = self.clone();
        let socket_for_task = Arc::clone(&socket);
        tokio::spawn(async move {
            let outcome = envelope_rx.await.map_err(|_| Error::Canceled).and_then(|r| r);
            socket_for_task.disconnect();

            let address = match outcome {
                Ok((their_ephemeral_public_key, encrypted_body)) => {
                    engine
                        .finish_autoprovision(&ephemeral, &their_ephemeral_public_key, &encrypted_body)
                        .await
                }
                Err(e) => Err(e),
            };
            let _ = result_tx.send(address);
        });

        Ok(AutoprovisionHandle {
            socket,
            waiter,
            result: result_rx,
        })
    }

    /// Decrypt the envelope, enforce the authenticated-user check, and
    /// bootstrap this device's full credentials (spec.md SS4.7 "On waiter
    /// resolution").
    async fn finish_autoprovision(
        &self,
        our_ephemeral: &DhKeyPair,
        their_ephemeral_public_key: &X25519PublicKey,
        encrypted_body: &[u8],
    ) -> Result<Address> {
        let plaintext = provisioning_cipher::decrypt(our_ephemeral, their_ephemeral_public_key, encrypted_body)?;
        let message = ProvisionMessage::decode(plaintext.as_slice()).map_err(|e| Error::InvalidProtoBuf(e.to_string()))?;

        let envelope_user_id = Uuid::parse_str(message.addr())
            .map_err(|e| Error::InvalidMessage(format!("malformed provisioning address: {e}")))?;

        // Security check (spec.md SS4.7): disallow provisioning if the
        // envelope's claimed user differs from who we're actually
        // authenticated as with the identity service.
        let authenticated_user_id = self.atlas.authenticated_user_id().await?;
        if envelope_user_id != authenticated_user_id {
            tracing::warn!(%envelope_user_id, %authenticated_user_id, "rejecting provisioning envelope for a foreign account");
            return Err(Error::InvalidMessage(
                "provisioning envelope user id does not match the authenticated account".into(),
            ));
        }

        let identity_key_private = message
            .identity_key_private
            .ok_or_else(|| Error::InvalidMessage("provisioning envelope missing identity key".into()))?;
        let private_bytes: [u8; 32] = identity_key_private
            .as_slice()
            .try_into()
            .map_err(|_| Error::InvalidKey("identity key private must be 32 bytes".into()))?;
        let identity = IdentityKeyPair::from_private_bytes(&private_bytes);

        let provisioning_code = message.provisioning_code().to_string();
        if provisioning_code.is_empty() {
            return Err(Error::InvalidMessage("provisioning envelope missing provisioning code".into()));
        }

        self.keystore.set_identity_key_pair(&identity).await?;
        let registration_id = random_registration_id();
        self.keystore.set_registration_id(registration_id).await?;
        let signaling_key = random_signaling_key();
        self.keystore.set_signaling_key(&signaling_key).await?;
        let password = random_password();
        self.keystore.set_password(&password).await?;

        // No device id exists yet; the device-linking PUT authenticates as
        // the bare account, sentinel device 0.
        let bootstrap_transport = SignalTransportClient::new(
            &self.config,
            self.config.services.signal_url.clone(),
            Address::new(envelope_user_id, 0),
            password.clone(),
        )?;
        let device_id = bootstrap_transport
            .link_this_device(&provisioning_code, &signaling_key, registration_id, &self.config.device_label)
            .await?;

        let address = Address::new(envelope_user_id, device_id);
        self.keystore.set_address(address).await?;
        self.keystore.set_server_url(&self.config.services.signal_url).await?;

        let transport = SignalTransportClient::new(&self.config, self.config.services.signal_url.clone(), address, password)?;
        bootstrap_prekeys(&self.config, &self.keystore, &transport, &identity).await?;

        tracing::info!(%address, "autoprovisioned a new device");
        Ok(address)
    }

    /// Primary-device role (`linkDevice`): answer a provisioning-request
    /// control payload from another of our devices by fetching a one-time
    /// verification code and shipping our identity key to the new device's
    /// ephemeral key.
    pub async fn link_device(
        &self,
        transport: &SignalTransportClient,
        uuid: Uuid,
        their_ephemeral_public_key: &X25519PublicKey,
    ) -> Result<bool> {
        let verification_code = transport.provisioning_code().await?;
        let our_address = self
            .keystore
            .address()
            .await?
            .ok_or_else(|| Error::Configuration("device is not registered".into()))?;
        let identity = self
            .keystore
            .identity_key_pair()
            .await?
            .ok_or_else(|| Error::Configuration("missing identity key pair".into()))?;

        let message = ProvisionMessage {
            identity_key_private: Some(identity.private_key_bytes().to_vec()),
            provisioning_code: Some(verification_code),
            user_agent: Some(self.config.user_agent.clone()),
            addr: Some(our_address.user_id.to_string()),
        };
        let (envelope, _our_ephemeral_public) = provisioning_cipher::encrypt(their_ephemeral_public_key, &message.encode_to_vec())?;
        transport.put_provisioning_message(&uuid.to_string(), &envelope).await
    }
}

/// Handle to an in-flight autoprovision attempt (spec.md SS5 "Cancellation":
/// "the autoprovision task exposes a `cancel()` that rejects its waiter with
/// a cancellation error and closes the socket").
pub struct AutoprovisionHandle {
    socket: Arc<SocketResource>,
    waiter: Arc<Mutex<Option<oneshot::Sender<WaiterResult>>>>,
    result: oneshot::Receiver<Result<Address>>,
}

impl AutoprovisionHandle {
    pub fn cancel(&self) {
        if let Some(sender) = self.waiter.lock().expect("provisioning waiter lock poisoned").take() {
            let _ = sender.send(Err(Error::Canceled));
        }
        self.socket.disconnect();
        tracing::info!("autoprovision attempt canceled");
    }

    pub async fn join(self) -> Result<Address> {
        self.result.await.map_err(|_| Error::Canceled)?
    }
}

/// Answers the two request types the provisioning socket carries (spec.md
/// SS4.7 "New-device role").
struct AutoprovisionHandler {
    atlas: Arc<AtlasClient>,
    our_ephemeral_public: X25519PublicKey,
    waiter: Arc<Mutex<Option<oneshot::Sender<WaiterResult>>>>,
}

#[async_trait]
impl RequestHandler for AutoprovisionHandler {
    async fn handle(&self, verb: &str, path: &str, body: Option<Vec<u8>>) -> (u32, Option<Vec<u8>>) {
        match (verb, path) {
            ("PUT", "/v1/address") => {
                let Some(body) = body else { return (400, None) };
                let Ok(parsed) = ProvisioningUuid::decode(body.as_slice()) else {
                    return (400, None);
                };
                let Ok(uuid) = Uuid::parse_str(parsed.uuid()) else {
                    return (400, None);
                };
                match self.atlas.broadcast_provisioning_key(uuid, self.our_ephemeral_public.as_bytes()).await {
                    Ok(()) => (200, None),
                    Err(_) => (500, None),
                }
            }
            ("PUT", "/v1/message") => {
                let Some(body) = body else { return (400, None) };
                let Ok(parsed) = ProvisioningEnvelope::decode(body.as_slice()) else {
                    return (400, None);
                };
                let (Some(public_key_bytes), Some(envelope_body)) = (parsed.public_key, parsed.body) else {
                    return (400, None);
                };
                let Ok(public_key_array) = <[u8; 32]>::try_from(public_key_bytes.as_slice()) else {
                    return (400, None);
                };
                let their_ephemeral_public_key = X25519PublicKey::from(public_key_array);

                if let Some(sender) = self.waiter.lock().expect("provisioning waiter lock poisoned").take() {
                    let _ = sender.send(Ok((their_ephemeral_public_key, envelope_body)));
                }
                (200, None)
            }
            _ => (400, None),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use prost::Message as _;

    use super::*;
    use crate::config::ClientConfig;
    use crate::proto::ProvisioningEnvelope;

    fn handler() -> (Arc<AutoprovisionHandler>, oneshot::Receiver<WaiterResult>) {
        let config = ClientConfig::default();
        let atlas = Arc::new(AtlasClient::new(&config, config.services.atlas_url.clone()).unwrap());
        let ephemeral = DhKeyPair::generate();
        let (tx, rx) = oneshot::channel();
        let handler = Arc::new(AutoprovisionHandler {
            atlas,
            our_ephemeral_public: *ephemeral.public_key(),
            waiter: Arc::new(Mutex::new(Some(tx))),
        });
        (handler, rx)
    }

    #[tokio::test]
    async fn rejects_an_unrecognized_request() {
        let (handler, _rx) = handler();
        let (status, _) = handler.handle("GET", "/v1/unknown", None).await;
        assert_eq!(status, 400);
    }

    #[tokio::test]
    async fn rejects_a_malformed_address_body() {
        let (handler, _rx) = handler();
        let (status, _) = handler.handle("PUT", "/v1/address", Some(vec![0xff, 0xff])).await;
        assert_eq!(status, 400);
    }

    #[tokio::test]
    async fn message_request_resolves_the_waiter() {
        let (handler, rx) = handler();
        let their_ephemeral = DhKeyPair::generate();
        let envelope = ProvisioningEnvelope {
            public_key: Some(their_ephemeral.public_key().as_bytes().to_vec()),
            body: Some(b"encrypted-body".to_vec()),
        };

        let (status, _) = handler.handle("PUT", "/v1/message", Some(envelope.encode_to_vec())).await;
        assert_eq!(status, 200);

        let (resolved_key, resolved_body) = rx.await.unwrap().unwrap();
        assert_eq!(resolved_key.as_bytes(), their_ephemeral.public_key().as_bytes());
        assert_eq!(resolved_body, b"encrypted-body");
    }

    #[tokio::test]
    async fn message_request_rejects_a_malformed_public_key() {
        let (handler, _rx) = handler();
        let envelope = ProvisioningEnvelope {
            public_key: Some(vec![1, 2, 3]),
            body: Some(b"x".to_vec()),
        };
        let (status, _) = handler.handle("PUT", "/v1/message", Some(envelope.encode_to_vec())).await;
        assert_eq!(status, 400);
    }

    #[test]
    fn cancel_rejects_the_waiter_and_disconnects_the_socket() {
        let config = ClientConfig::default();
        let (tx, rx) = oneshot::channel::<WaiterResult>();
        let (_result_tx, result_rx) = oneshot::channel();
        let socket = SocketResource::new(
            format!("{}/v1/websocket/provisioning/", config.services.signal_websocket_url),
            ReconnectPolicy::default(),
            Arc::new(EventBus::new()),
        );
        let handle = AutoprovisionHandle {
            socket,
            waiter: Arc::new(Mutex::new(Some(tx))),
            result: result_rx,
        };

        handle.cancel();
        assert!(matches!(rx.try_recv().unwrap(), Err(Error::Canceled)));
    }
}
