//! Inbound message pipeline: socket requests carrying framed, encrypted
//! envelopes are decrypted and dispatched as broadcast events (spec.md SS4.6
//! "Message receiver").

use std::sync::Arc;

use async_trait::async_trait;
use prost::Message as _;
use uuid::Uuid;

use crate::address::Address;
use crate::crypto::signaling::SignalingKeyCipher;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus, InboundMessage};
use crate::keystore::KeyStore;
use crate::padding::unpad;
use crate::proto::{data_message, envelope, sync_message, Content, Envelope};
use crate::session::{accept_session, no_session_error, DoubleRatchetCipher, PreKeySignalHeader};
use crate::socket::RequestHandler;

pub struct MessageReceiver {
    keystore: KeyStore,
    events: Arc<EventBus>,
}

impl MessageReceiver {
    pub fn new(keystore: KeyStore, events: Arc<EventBus>) -> Self {
        Self { keystore, events }
    }

    async fn handle_message(&self, framed: &[u8]) -> Result<()> {
        let signaling_key = self
            .keystore
            .signaling_key()
            .await?
            .ok_or_else(|| Error::Configuration("missing signaling key".into()))?;
        let cipher = SignalingKeyCipher::new(&signaling_key)?;
        let envelope_bytes = cipher.decrypt(framed)?;
        let envelope = Envelope::decode(envelope_bytes.as_slice()).map_err(|e| Error::InvalidProtoBuf(e.to_string()))?;

        if envelope.r#type() == envelope::Type::Receipt {
            let source = Self::envelope_source(&envelope)?;
            self.events.notify(Event::DeliveryReceipt {
                source,
                timestamp: envelope.timestamp() as i64,
            });
            return Ok(());
        }

        if let Some(content_bytes) = envelope.content.clone() {
            self.decrypt_and_dispatch(&envelope, &content_bytes).await?;
            return Ok(());
        }

        if envelope.legacy_message.is_some() {
            return Err(Error::LegacyMessage);
        }

        Err(Error::InvalidMessage("envelope carries neither content nor a legacy message".into()))
    }

    /// spec.md SS5 "Reject with `400` on anything malformed; reject with
    /// `500` on any crypto failure": malformed framing/content is the
    /// caller's fault, a crypto failure is ours (or genuinely undecryptable).
    fn status_for_error(error: &Error) -> u32 {
        match error {
            Error::InvalidLength
            | Error::InvalidType(_)
            | Error::InvalidProtoBuf(_)
            | Error::InvalidMessage(_)
            | Error::InvalidId(_)
            | Error::LegacyMessage => 400,
            _ => 500,
        }
    }

    fn envelope_source(envelope: &Envelope) -> Result<Address> {
        let user_id = Uuid::parse_str(envelope.source_uuid()).map_err(|e| Error::InvalidId(e.to_string()))?;
        Ok(Address::new(user_id, envelope.source_device()))
    }

    async fn decrypt_and_dispatch(&self, envelope: &Envelope, content_bytes: &[u8]) -> Result<()> {
        let source = Self::envelope_source(envelope)?;
        let is_prekey_bundle = envelope.r#type() == envelope::Type::PrekeyBundle;

        let padded_plaintext = if is_prekey_bundle {
            self.decrypt_prekey_bundle_message(source, content_bytes).await?
        } else {
            self.decrypt_signal_message(source, content_bytes).await?
        };
        let plaintext = unpad(&padded_plaintext)?;
        let content = Content::decode(plaintext.as_slice()).map_err(|e| Error::InvalidProtoBuf(e.to_string()))?;

        let server_received_timestamp = if envelope.server_timestamp() != 0 {
            Some(envelope.server_timestamp() as i64)
        } else {
            None
        };

        if let Some(data_message) = content.data_message {
            self.events.notify(Event::InboundMessage(Self::inbound_from_data_message(
                source,
                envelope.timestamp() as i64,
                server_received_timestamp,
                data_message,
                None,
                None,
            )));
            return Ok(());
        }

        if let Some(sync_message) = content.sync_message {
            if let Some(sent) = sync_message.sent {
                let data_message = sent
                    .message
                    .ok_or_else(|| Error::InvalidMessage("sync.sent missing message".into()))?;
                let timestamp = sent.timestamp.map(|t| t as i64).unwrap_or_else(|| envelope.timestamp() as i64);
                let destination = sent.destination_uuid.as_deref().and_then(|s| Uuid::parse_str(s).ok());
                self.events.notify(Event::InboundMessage(Self::inbound_from_data_message(
                    source,
                    timestamp,
                    server_received_timestamp,
                    data_message,
                    sent.expiration_start_timestamp.map(|t| t as i64),
                    destination,
                )));
                return Ok(());
            }

            if !sync_message.read.is_empty() {
                let receipts: Vec<(Uuid, i64)> = sync_message
                    .read
                    .iter()
                    .filter_map(|r| Uuid::parse_str(r.sender_uuid()).ok().map(|uuid| (uuid, r.timestamp() as i64)))
                    .collect();
                if !receipts.is_empty() {
                    self.events.notify(Event::ReadSyncReceipts(receipts));
                    return Ok(());
                }
            }
        }

        Err(Error::InvalidMessage("content carries neither a dataMessage nor a syncMessage".into()))
    }

    fn inbound_from_data_message(
        source: Address,
        timestamp: i64,
        server_received_timestamp: Option<i64>,
        data_message: crate::proto::DataMessage,
        expiration_start_timestamp: Option<i64>,
        destination: Option<Uuid>,
    ) -> InboundMessage {
        let flags = data_message.flags.unwrap_or(0);
        InboundMessage {
            source,
            timestamp,
            expire_timer: data_message.expire_timer,
            server_age: None,
            server_received_timestamp,
            end_session: flags & (data_message::Flags::EndSession as u32) != 0,
            expiration_timer_update: flags & (data_message::Flags::ExpirationTimerUpdate as u32) != 0,
            body: data_message.body.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()),
            expiration_start_timestamp,
            destination,
        }
    }

    /// First message on a brand-new session: complete X3DH from the inline
    /// header, consume the one-time prekey it names, then decrypt.
    async fn decrypt_prekey_bundle_message(&self, source: Address, content_bytes: &[u8]) -> Result<Vec<u8>> {
        let (header, ratchet_message) = PreKeySignalHeader::unwrap(content_bytes)?;

        if !self.keystore.is_trusted(source, &header.identity_key).await? {
            return Err(Error::untrusted_identity(source, header.identity_key.as_bytes().to_vec()));
        }
        self.keystore.set_trusted_identity(source, &header.identity_key).await?;

        let mut cipher = match self.keystore.load_session(source).await? {
            Some(state) => DoubleRatchetCipher::from_state(state),
            None => {
                let our_identity = self
                    .keystore
                    .identity_key_pair()
                    .await?
                    .ok_or_else(|| Error::Configuration("missing identity key pair".into()))?;
                let our_signed_pre_key = self
                    .keystore
                    .load_signed_pre_key(header.signed_pre_key_id)
                    .await?
                    .ok_or_else(|| Error::InvalidId("unknown signed prekey id".into()))?;
                let our_one_time_pre_key = match header.pre_key_id {
                    Some(id) => self.keystore.load_pre_key(id).await?,
                    None => None,
                };

                let cipher = accept_session(
                    &our_identity,
                    &our_signed_pre_key.key_pair,
                    our_one_time_pre_key.as_ref().map(|pre_key| &pre_key.key_pair),
                    &header.identity_key,
                    &header.ephemeral_key,
                )?;

                if let Some(pre_key_id) = header.pre_key_id {
                    self.keystore.remove_pre_key(pre_key_id).await?;
                }
                cipher
            }
        };

        let plaintext = cipher.decrypt(ratchet_message).await?;
        self.keystore.store_session(source, &cipher.into_state()).await?;
        tracing::debug!(%source, "decrypted a prekey-bundle message");
        Ok(plaintext)
    }

    async fn decrypt_signal_message(&self, source: Address, content_bytes: &[u8]) -> Result<Vec<u8>> {
        let state = self.keystore.load_session(source).await?.ok_or_else(|| no_session_error(source))?;
        let mut cipher = DoubleRatchetCipher::from_state(state);
        let plaintext = cipher.decrypt(content_bytes).await?;
        self.keystore.store_session(source, &cipher.into_state()).await?;
        Ok(plaintext)
    }
}

#[async_trait]
impl RequestHandler for MessageReceiver {
    /// Accepts `PUT /api/v1/message` (body present) and `PUT
    /// /api/v1/queue/empty` (no body); anything else is a `400` (spec.md
    /// SS4.6).
    async fn handle(&self, verb: &str, path: &str, body: Option<Vec<u8>>) -> (u32, Option<Vec<u8>>) {
        match (verb, path, body) {
            ("PUT", "/api/v1/queue/empty", None) => {
                self.events.notify(Event::QueueEmpty);
                (200, None)
            }
            ("PUT", "/api/v1/message", Some(body)) => match self.handle_message(&body).await {
                Ok(()) => (200, None),
                Err(e) => {
                    let status = Self::status_for_error(&e);
                    tracing::error!(error = %e, status, "failed to decrypt/dispatch an inbound envelope");
                    (status, None)
                }
            },
            _ => (400, None),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::events::Event;
    use crate::proto::{data_message, DataMessage};
    use crate::store::MemoryBackend;

    fn receiver() -> MessageReceiver {
        MessageReceiver::new(KeyStore::new(Arc::new(MemoryBackend::new())), Arc::new(EventBus::new()))
    }

    #[test]
    fn status_for_error_maps_malformed_taxonomy_to_400() {
        assert_eq!(MessageReceiver::status_for_error(&Error::InvalidLength), 400);
        assert_eq!(MessageReceiver::status_for_error(&Error::InvalidProtoBuf("x".into())), 400);
        assert_eq!(MessageReceiver::status_for_error(&Error::InvalidMessage("x".into())), 400);
        assert_eq!(MessageReceiver::status_for_error(&Error::InvalidId("x".into())), 400);
        assert_eq!(MessageReceiver::status_for_error(&Error::LegacyMessage), 400);
    }

    #[test]
    fn status_for_error_maps_crypto_failures_to_500() {
        assert_eq!(MessageReceiver::status_for_error(&Error::InvalidMac), 500);
        assert_eq!(MessageReceiver::status_for_error(&Error::Decryption("x".into())), 500);
        assert_eq!(MessageReceiver::status_for_error(&Error::InvalidSignature), 500);
    }

    #[test]
    fn envelope_source_parses_uuid_and_device() {
        let user_id = Uuid::new_v4();
        let envelope = Envelope {
            source_uuid: Some(user_id.to_string()),
            source_device: Some(7),
            ..Default::default()
        };
        let source = MessageReceiver::envelope_source(&envelope).unwrap();
        assert_eq!(source, Address::new(user_id, 7));
    }

    #[test]
    fn envelope_source_rejects_malformed_uuid() {
        let envelope = Envelope {
            source_uuid: Some("not-a-uuid".to_string()),
            source_device: Some(1),
            ..Default::default()
        };
        assert!(matches!(MessageReceiver::envelope_source(&envelope), Err(Error::InvalidId(_))));
    }

    #[test]
    fn inbound_from_data_message_decodes_end_session_flag() {
        let source = Address::new(Uuid::new_v4(), 1);
        let data_message = DataMessage {
            body: Some(b"hello".to_vec()),
            flags: Some(data_message::Flags::EndSession as u32),
            ..Default::default()
        };
        let inbound = MessageReceiver::inbound_from_data_message(source, 1000, Some(1001), data_message, None, None);
        assert_eq!(inbound.body.as_deref(), Some("hello"));
        assert!(inbound.end_session);
        assert!(!inbound.expiration_timer_update);
        assert_eq!(inbound.timestamp, 1000);
        assert_eq!(inbound.server_received_timestamp, Some(1001));
    }

    #[tokio::test]
    async fn queue_empty_request_notifies_and_returns_200() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct CountingObserver {
            count: Arc<AtomicUsize>,
        }
        impl crate::events::Observer for CountingObserver {
            fn on_event(&self, event: &Event) {
                assert!(matches!(event, Event::QueueEmpty));
                self.count.fetch_add(1, Ordering::SeqCst);
            }
        }

        let receiver = receiver();
        let count = Arc::new(AtomicUsize::new(0));
        let observer: Arc<dyn crate::events::Observer> = Arc::new(CountingObserver { count: count.clone() });
        receiver.events.subscribe(&observer);

        let (status, body) = receiver.handle("PUT", "/api/v1/queue/empty", None).await;
        assert_eq!(status, 200);
        assert!(body.is_none());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unrecognized_request_is_rejected() {
        let receiver = receiver();
        let (status, _) = receiver.handle("GET", "/api/v1/unknown", None).await;
        assert_eq!(status, 400);
    }

    #[tokio::test]
    async fn message_with_no_signaling_key_fails_closed() {
        let receiver = receiver();
        let (status, _) = receiver.handle("PUT", "/api/v1/message", Some(vec![1, 2, 3])).await;
        assert_eq!(status, 500);
    }
}
