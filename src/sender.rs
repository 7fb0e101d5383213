//! Outbound message pipeline: pad, encrypt per recipient device, deliver,
//! recover from stale devices / identity changes / vanished sessions
//! (spec.md SS4.5 "Message sender").

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use prost::Message as _;
use reqwest::StatusCode;
use uuid::Uuid;

use crate::address::{Address, Recipient};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::keystore::KeyStore;
use crate::padding::pad;
use crate::payload::Payload;
use crate::proto::{data_message, sync_message, AttachmentPointer, Content, DataMessage, SyncMessage};
use crate::session::{initiate_session, no_session_error, DoubleRatchetCipher, PreKeySignalHeader};
use crate::transport::models::OutgoingMessageJson;
use crate::transport::signal_client::{SignalTransportClient, ENVELOPE_TYPE_CIPHERTEXT, ENVELOPE_TYPE_PREKEY_BUNDLE};

/// Per-send knobs (spec.md SS4.5: flags, expiration timer, `syncToSelf`).
#[derive(Clone, Debug, Default)]
pub struct SendOptions {
    pub sync_to_self: bool,
    pub end_session: bool,
    pub expiration_timer_update: bool,
    pub expire_timer: Option<u32>,
    pub attachments: Vec<AttachmentPointer>,
}

impl SendOptions {
    pub fn new() -> Self {
        Self {
            sync_to_self: true,
            ..Default::default()
        }
    }
}

/// Acknowledgement emitted per delivery target (spec.md SS3
/// "TransmissionInfo").
#[derive(Clone, Debug)]
pub struct TransmissionInfo {
    pub recipient: Recipient,
    pub device_count: usize,
    pub received_at: i64,
    pub needs_sync: bool,
}

pub struct MessageSender {
    #[allow(dead_code)]
    config: ClientConfig,
    keystore: KeyStore,
    transport: Arc<SignalTransportClient>,
    events: Arc<EventBus>,
}

impl MessageSender {
    pub fn new(config: ClientConfig, keystore: KeyStore, transport: Arc<SignalTransportClient>, events: Arc<EventBus>) -> Self {
        Self {
            config,
            keystore,
            transport,
            events,
        }
    }

    /// Send `payload` to every recipient, skipping references to our own
    /// account, then optionally fan out a sync copy to our other devices.
    pub async fn send(&self, payload: &Payload, recipients: &[Recipient], options: SendOptions) -> Result<Vec<TransmissionInfo>> {
        payload.sanity_check()?;

        let our_address = self.our_address().await?;
        let data_message = self.build_data_message(payload, &options)?;

        let content = Content {
            data_message: Some(data_message.clone()),
            sync_message: None,
        };
        let padded = pad(&content.encode_to_vec());

        let mut results = Vec::with_capacity(recipients.len() + 1);
        for recipient in recipients {
            if Self::is_self(recipient, our_address) {
                continue;
            }

            let received_at = Utc::now().timestamp_millis();
            let device_count = match recipient {
                Recipient::Device(address) => {
                    self.send_to_device(*address, &padded).await?;
                    1
                }
                Recipient::User(user_id) => self.send_to_user(*user_id, &padded).await?,
            };
            results.push(TransmissionInfo {
                recipient: recipient.clone(),
                device_count,
                received_at,
                needs_sync: false,
            });
        }

        if options.sync_to_self {
            let device_count = self.send_sync_to_self(our_address, &data_message, &options).await?;
            if device_count > 0 {
                results.push(TransmissionInfo {
                    recipient: Recipient::User(our_address.user_id),
                    device_count,
                    received_at: Utc::now().timestamp_millis(),
                    needs_sync: true,
                });
            }
        }

        Ok(results)
    }

    fn is_self(recipient: &Recipient, our_address: Address) -> bool {
        match recipient {
            Recipient::Device(address) => *address == our_address,
            Recipient::User(user_id) => *user_id == our_address.user_id,
        }
    }

    fn build_data_message(&self, payload: &Payload, options: &SendOptions) -> Result<DataMessage> {
        let body = payload.encode()?.into_bytes();

        let mut flags = 0u32;
        if options.end_session {
            flags |= data_message::Flags::EndSession as u32;
        }
        if options.expiration_timer_update {
            flags |= data_message::Flags::ExpirationTimerUpdate as u32;
        }

        Ok(DataMessage {
            body: Some(body),
            attachments: options.attachments.clone(),
            flags: if flags != 0 { Some(flags) } else { None },
            expire_timer: options.expire_timer,
        })
    }

    async fn our_address(&self) -> Result<Address> {
        self.keystore
            .address()
            .await?
            .ok_or_else(|| Error::Configuration("device is not registered".into()))
    }

    /// `sendToDevice` (spec.md SS4.5 step 5): retry once on `410` by dropping
    /// the stale session and re-establishing from scratch.
    async fn send_to_device(&self, address: Address, plaintext: &[u8]) -> Result<()> {
        let mut retries_left = 1u8;
        loop {
            let (ciphertext, registration_id, is_new_session) = self.encrypt_with_key_change_recovery(address, plaintext).await?;
            let envelope_type = if is_new_session {
                ENVELOPE_TYPE_PREKEY_BUNDLE
            } else {
                ENVELOPE_TYPE_CIPHERTEXT
            };
            let timestamp = Utc::now().timestamp_millis();

            match self
                .transport
                .deliver_to_device(address.user_id, address.device_id, envelope_type, &ciphertext, registration_id, timestamp)
                .await
            {
                Ok(()) => return Ok(()),
                Err(Error::RequestRejected { status, .. }) if status == 410 && retries_left > 0 => {
                    tracing::warn!(%address, "stale session reported, re-establishing and retrying");
                    retries_left -= 1;
                    self.keystore.delete_session(address).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// `sendToUser` (spec.md SS4.5 step 6): `409` means some devices are
    /// extra, `410` means some are stale; both are resolved by refreshing the
    /// device list and retrying, but they share a single retry budget so the
    /// whole exchange still converges in at most two HTTP round-trips.
    async fn send_to_user(&self, user_id: Uuid, plaintext: &[u8]) -> Result<usize> {
        let mut device_ids = self.keystore.device_ids_for_user(user_id).await?;
        if device_ids.is_empty() {
            device_ids = self.update_prekeys_for_user(user_id).await?;
        }
        if device_ids.is_empty() {
            return Err(Error::InvalidId(format!("no known devices for user {user_id}")));
        }

        let mut retry_available = true;
        let timestamp = Utc::now().timestamp_millis();

        loop {
            let mut messages = Vec::with_capacity(device_ids.len());
            for device_id in &device_ids {
                let address = Address::new(user_id, *device_id);
                let (ciphertext, registration_id, is_new_session) = self.encrypt_with_key_change_recovery(address, plaintext).await?;
                let envelope_type = if is_new_session {
                    ENVELOPE_TYPE_PREKEY_BUNDLE
                } else {
                    ENVELOPE_TYPE_CIPHERTEXT
                };
                messages.push(OutgoingMessageJson {
                    envelope_type,
                    content: BASE64.encode(&ciphertext),
                    destination_registration_id: registration_id,
                    destination_device_id: *device_id,
                    timestamp,
                });
            }

            let outcome = self.transport.deliver_to_user(user_id, messages, timestamp).await?;
            if outcome.status.is_success() {
                return Ok(device_ids.len());
            }

            if outcome.status == StatusCode::CONFLICT && retry_available {
                retry_available = false;
                for extra in &outcome.mismatch.extra_devices {
                    self.keystore.delete_session(Address::new(user_id, *extra)).await?;
                }
                device_ids = self.update_prekeys_for_user(user_id).await?;
                continue;
            }
            if outcome.status == StatusCode::GONE && retry_available {
                retry_available = false;
                for stale in &outcome.mismatch.stale_devices {
                    self.keystore.delete_session(Address::new(user_id, *stale)).await?;
                }
                device_ids = self.update_prekeys_for_user(user_id).await?;
                continue;
            }

            return Err(Error::request_rejected(outcome.status.as_u16(), serde_json::Value::Null));
        }
    }

    async fn send_sync_to_self(&self, our_address: Address, data_message: &DataMessage, options: &SendOptions) -> Result<usize> {
        let now = Utc::now().timestamp_millis();
        let sent = sync_message::Sent {
            message: Some(data_message.clone()),
            destination_uuid: None,
            timestamp: Some(now as u64),
            expiration_start_timestamp: options.expire_timer.map(|_| now as u64),
        };
        let content = Content {
            data_message: None,
            sync_message: Some(SyncMessage {
                sent: Some(sent),
                read: Vec::new(),
            }),
        };
        let padded = pad(&content.encode_to_vec());

        let mut device_ids = self.keystore.device_ids_for_user(our_address.user_id).await?;
        device_ids.retain(|id| *id != our_address.device_id);
        if device_ids.is_empty() {
            return Ok(0);
        }

        for device_id in &device_ids {
            self.send_to_device(Address::new(our_address.user_id, *device_id), &padded).await?;
        }
        Ok(device_ids.len())
    }

    /// Fetch every known device's prekey bundle for `user_id`, establishing a
    /// session (and stashing its prekey header) for any device we don't yet
    /// have one for.
    async fn update_prekeys_for_user(&self, user_id: Uuid) -> Result<Vec<u32>> {
        let bundles = self.transport.get_keys_for_addr(user_id, None).await?;
        let mut device_ids = Vec::with_capacity(bundles.len());
        for bundle in bundles {
            let address = Address::new(user_id, bundle.device_id);
            device_ids.push(bundle.device_id);
            self.ensure_session_established(address, Some(bundle)).await?;
        }
        device_ids.sort_unstable();
        Ok(device_ids)
    }

    async fn ensure_session_established(&self, address: Address, bundle: Option<crate::crypto::keys::PreKeyBundle>) -> Result<()> {
        if self.keystore.has_session(address).await? {
            return Ok(());
        }

        let bundle = match bundle {
            Some(bundle) => bundle,
            None => self
                .transport
                .get_keys_for_addr(address.user_id, Some(address.device_id))
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| no_session_error(address))?,
        };

        if !self.keystore.is_trusted(address, &bundle.identity_key).await? {
            return Err(Error::untrusted_identity(address, bundle.identity_key.as_bytes().to_vec()));
        }
        self.keystore.set_trusted_identity(address, &bundle.identity_key).await?;

        let our_identity = self
            .keystore
            .identity_key_pair()
            .await?
            .ok_or_else(|| Error::Configuration("missing identity key pair".into()))?;
        let initial = initiate_session(&our_identity, &bundle)?;
        let header = PreKeySignalHeader {
            identity_key: initial.our_identity_key.clone(),
            ephemeral_key: initial.our_ephemeral_key,
            pre_key_id: initial.used_pre_key_id,
            signed_pre_key_id: initial.used_signed_pre_key_id,
        };

        self.keystore.store_session(address, &initial.cipher.into_state()).await?;
        self.keystore.store_remote_registration_id(address, bundle.registration_id).await?;
        self.keystore.store_pending_prekey_header(address, header.header_bytes()).await?;
        tracing::info!(%address, "established a new session");
        Ok(())
    }

    /// `encryptWithKeyChangeRecovery` (spec.md SS4.5 step 5): at most two
    /// attempts; an `untrustedIdentity` on the first clears the stored
    /// identity and retries once, any other error (or a second
    /// `untrustedIdentity`) is fatal.
    async fn encrypt_with_key_change_recovery(&self, address: Address, plaintext: &[u8]) -> Result<(Vec<u8>, u32, bool)> {
        let mut allow_trust_retry = true;
        loop {
            match self.ensure_session_established(address, None).await {
                Ok(()) => break,
                Err(e @ Error::UntrustedIdentity { address: addr, .. }) if allow_trust_retry => {
                    tracing::warn!(address = %addr, "identity key changed, clearing trust and retrying once");
                    self.keystore.remove_trusted_identity(addr).await?;
                    self.events.notify(e.into());
                    allow_trust_retry = false;
                }
                Err(e) => return Err(e),
            }
        }

        let state = self
            .keystore
            .load_session(address)
            .await?
            .ok_or_else(|| no_session_error(address))?;
        let mut cipher = DoubleRatchetCipher::from_state(state);
        let ratchet_ciphertext = cipher.encrypt(plaintext).await?;
        self.keystore.store_session(address, &cipher.into_state()).await?;

        let registration_id = self.keystore.load_remote_registration_id(address).await?.unwrap_or(0);
        let pending_header = self.keystore.take_pending_prekey_header(address).await?;

        match pending_header {
            Some(header_bytes) => Ok((
                PreKeySignalHeader::wrap_header_bytes(&header_bytes, &ratchet_ciphertext),
                registration_id,
                true,
            )),
            None => Ok((ratchet_ciphertext, registration_id, false)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use uuid::Uuid;

    use super::*;
    use crate::config::ClientConfig;
    use crate::events::EventBus;
    use crate::payload::{MessageType, Payload};
    use crate::store::MemoryBackend;

    fn sender() -> (MessageSender, Address) {
        let config = ClientConfig::default();
        let keystore = KeyStore::new(Arc::new(MemoryBackend::new()));
        let address = Address::new(Uuid::new_v4(), 1);
        let transport = Arc::new(
            SignalTransportClient::new(&config, config.services.signal_url.clone(), address, "pw").unwrap(),
        );
        (MessageSender::new(config, keystore, transport, Arc::new(EventBus::new())), address)
    }

    #[test]
    fn send_options_new_defaults_to_syncing_to_self() {
        let options = SendOptions::new();
        assert!(options.sync_to_self);
        assert!(!options.end_session);
        assert!(!options.expiration_timer_update);
        assert_eq!(options.expire_timer, None);
    }

    #[test]
    fn is_self_matches_our_own_device_and_user() {
        let our_address = Address::new(Uuid::new_v4(), 1);
        let other_device = Recipient::Device(Address::new(our_address.user_id, 2));
        let same_device = Recipient::Device(our_address);
        let same_user = Recipient::User(our_address.user_id);
        let other_user = Recipient::User(Uuid::new_v4());

        assert!(MessageSender::is_self(&same_device, our_address));
        assert!(MessageSender::is_self(&same_user, our_address));
        assert!(!MessageSender::is_self(&other_device, our_address));
        assert!(!MessageSender::is_self(&other_user, our_address));
    }

    #[test]
    fn build_data_message_sets_flags_from_options() {
        let (sender, _address) = sender();
        let payload = Payload::new(MessageType::Content, Uuid::new_v4(), "@a");

        let plain = sender.build_data_message(&payload, &SendOptions::new()).unwrap();
        assert_eq!(plain.flags, None);

        let mut options = SendOptions::new();
        options.end_session = true;
        options.expiration_timer_update = true;
        let flagged = sender.build_data_message(&payload, &options).unwrap();
        let flags = flagged.flags.unwrap();
        assert_ne!(flags & data_message::Flags::EndSession as u32, 0);
        assert_ne!(flags & data_message::Flags::ExpirationTimerUpdate as u32, 0);
    }

    #[tokio::test]
    async fn send_rejects_a_payload_that_fails_sanity_check() {
        let (sender, _address) = sender();
        let mut payload = Payload::new(MessageType::Content, Uuid::new_v4(), "@a");
        payload.distribution.expression.clear();

        let err = sender.send(&payload, &[], SendOptions::new()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidPayload(_)));
    }

    #[tokio::test]
    async fn send_with_no_recipients_and_no_sync_returns_empty() {
        let (sender, address) = sender();
        sender.keystore.set_address(address).await.unwrap();
        let payload = Payload::new(MessageType::Content, Uuid::new_v4(), "@a");
        let mut options = SendOptions::new();
        options.sync_to_self = false;

        let results = sender.send(&payload, &[], options).await.unwrap();
        assert!(results.is_empty());
    }
}
