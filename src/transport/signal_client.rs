//! HTTP surface against the relay (spec.md SS4.2 "Signal transport client"),
//! authenticated with HTTP Basic `"<address>:<password>"`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde_json::Value;

use crate::address::Address;
use crate::config::ClientConfig;
use crate::crypto::keys::{IdentityPublicKey, PreKey, PreKeyBundle, SignedPreKey};
use crate::error::{Error, Result};

use super::models::{
    KeysForAddrResponse, LinkDeviceRequest, LinkDeviceResponse, MismatchedDevicesJson, OutgoingMessageJson,
    OutgoingMessageListJson, PreKeyEntryJson, ProvisioningCodeResponse, ProvisioningMessageRequest,
    SignedPreKeyEntryJson, UploadKeysRequest,
};

/// Envelope type tags as carried on the wire (spec.md SS3 "Envelope").
pub const ENVELOPE_TYPE_CIPHERTEXT: u32 = 1;
pub const ENVELOPE_TYPE_PREKEY_BUNDLE: u32 = 3;
pub const ENVELOPE_TYPE_RECEIPT: u32 = 5;

/// Result of a user-targeted fan-out (spec.md SS4.5 `sendToUser`).
pub struct UserDeliveryOutcome {
    pub status: StatusCode,
    pub mismatch: MismatchedDevicesJson,
}

pub struct SignalTransportClient {
    http: Client,
    base_url: String,
    address: Address,
    password: String,
}

impl SignalTransportClient {
    pub fn new(config: &ClientConfig, base_url: impl Into<String>, address: Address, password: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Configuration(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            address,
            password: password.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn check_status(status: StatusCode, body: Value) -> Result<Value> {
        if status.is_success() {
            Ok(body)
        } else {
            Err(Error::request_rejected(status.as_u16(), body))
        }
    }

    /// `PUT /v2/keys` (spec.md SS4.2 `registerAccount`). Must be idempotent
    /// in the sense that re-invocation replaces all key material.
    pub async fn upload_keys(
        &self,
        identity_key: &IdentityPublicKey,
        pre_keys: &[PreKey],
        signed_pre_key: &SignedPreKey,
    ) -> Result<()> {
        let body = UploadKeysRequest {
            identity_key: BASE64.encode(identity_key.as_bytes()),
            pre_keys: pre_keys
                .iter()
                .map(|pre_key| PreKeyEntryJson {
                    key_id: pre_key.id,
                    public_key: BASE64.encode(pre_key.key_pair.public_key().as_bytes()),
                })
                .collect(),
            signed_pre_key: SignedPreKeyEntryJson {
                key_id: signed_pre_key.id,
                public_key: BASE64.encode(signed_pre_key.key_pair.public_key().as_bytes()),
                signature: BASE64.encode(signed_pre_key.signature),
            },
        };

        let response = self
            .http
            .put(self.url("/v2/keys"))
            .basic_auth(self.address.to_string(), Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::RequestFailure(e.to_string()))?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        Self::check_status(status, body).await?;
        Ok(())
    }

    /// `GET /v2/keys/<user>/<device|*>`. A wildcard device returns one
    /// bundle per known device for that user, or an empty list — never an
    /// error (spec.md SS8 boundary behaviors).
    pub async fn get_keys_for_addr(&self, user_id: uuid::Uuid, device_id: Option<u32>) -> Result<Vec<PreKeyBundle>> {
        let device_segment = device_id.map(|d| d.to_string()).unwrap_or_else(|| "*".to_string());
        let response = self
            .http
            .get(self.url(&format!("/v2/keys/{}/{}", user_id, device_segment)))
            .basic_auth(self.address.to_string(), Some(&self.password))
            .send()
            .await
            .map_err(|e| Error::RequestFailure(e.to_string()))?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        let body = Self::check_status(status, body).await?;

        let parsed: KeysForAddrResponse =
            serde_json::from_value(body).map_err(|e| Error::MalformedResponse(e.to_string()))?;
        let identity_key_bytes: [u8; 32] = BASE64
            .decode(&parsed.identity_key)
            .map_err(|e| Error::MalformedResponse(e.to_string()))?
            .try_into()
            .map_err(|_| Error::InvalidKey("identity key must be 32 bytes".into()))?;
        let identity_key = IdentityPublicKey::from_bytes(&identity_key_bytes)?;

        parsed
            .devices
            .into_iter()
            .map(|device| decode_bundle(device, identity_key.clone()))
            .collect()
    }

    /// `PUT /v1/messages/<user>/<device>` (spec.md SS4.5 `sendToDevice`).
    pub async fn deliver_to_device(
        &self,
        user_id: uuid::Uuid,
        device_id: u32,
        envelope_type: u32,
        content: &[u8],
        destination_registration_id: u32,
        timestamp: i64,
    ) -> Result<()> {
        let body = OutgoingMessageJson {
            envelope_type,
            content: BASE64.encode(content),
            destination_registration_id,
            destination_device_id: device_id,
            timestamp,
        };

        let response = self
            .http
            .put(self.url(&format!("/v1/messages/{}/{}", user_id, device_id)))
            .basic_auth(self.address.to_string(), Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::RequestFailure(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body: Value = response.json().await.unwrap_or(Value::Null);
        Err(Error::request_rejected(status.as_u16(), body))
    }

    /// `PUT /v1/messages/<user>` (spec.md SS4.5 `sendToUser`); the relay
    /// multiplexes to every known device and reports the mismatch on
    /// `409`/`410`.
    pub async fn deliver_to_user(
        &self,
        user_id: uuid::Uuid,
        messages: Vec<OutgoingMessageJson>,
        timestamp: i64,
    ) -> Result<UserDeliveryOutcome> {
        let body = OutgoingMessageListJson { messages, timestamp };

        let response = self
            .http
            .put(self.url(&format!("/v1/messages/{}", user_id)))
            .basic_auth(self.address.to_string(), Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::RequestFailure(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(UserDeliveryOutcome {
                status,
                mismatch: MismatchedDevicesJson::default(),
            });
        }
        if status == StatusCode::CONFLICT || status == StatusCode::GONE {
            let mismatch: MismatchedDevicesJson = response.json().await.unwrap_or_default();
            return Ok(UserDeliveryOutcome { status, mismatch });
        }
        let body: Value = response.json().await.unwrap_or(Value::Null);
        Err(Error::request_rejected(status.as_u16(), body))
    }

    /// First leg of `fetchAttachment`: obtain the signed download URL.
    pub async fn attachment_download_url(&self, attachment_id: &str) -> Result<String> {
        let response = self
            .http
            .get(self.url(&format!("/v1/attachments/{}", attachment_id)))
            .basic_auth(self.address.to_string(), Some(&self.password))
            .send()
            .await
            .map_err(|e| Error::RequestFailure(e.to_string()))?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        let body = Self::check_status(status, body).await?;
        body.get("location")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::MalformedResponse("missing attachment location".into()))
    }

    /// Second leg: GET the ciphertext from the signed URL.
    pub async fn fetch_attachment_ciphertext(&self, signed_url: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(signed_url)
            .send()
            .await
            .map_err(|e| Error::RequestFailure(e.to_string()))?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(|e| Error::RequestFailure(e.to_string()))?;
        if !status.is_success() {
            return Err(Error::request_rejected(status.as_u16(), Value::Null));
        }
        Ok(bytes.to_vec())
    }

    /// `GET /v1/devices/provisioning/code` (spec.md SS4.7 `linkDevice`).
    pub async fn provisioning_code(&self) -> Result<String> {
        let response = self
            .http
            .get(self.url("/v1/devices/provisioning/code"))
            .basic_auth(self.address.to_string(), Some(&self.password))
            .send()
            .await
            .map_err(|e| Error::RequestFailure(e.to_string()))?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        let body = Self::check_status(status, body).await?;
        let parsed: ProvisioningCodeResponse =
            serde_json::from_value(body).map_err(|e| Error::MalformedResponse(e.to_string()))?;
        Ok(parsed.verification_code)
    }

    /// `PUT /v1/provisioning/<uuid>`. 404 means another primary device
    /// handled it first, reported as `Ok(false)` rather than an error.
    pub async fn put_provisioning_message(&self, uuid: &str, encrypted_envelope: &[u8]) -> Result<bool> {
        let body = ProvisioningMessageRequest {
            body: BASE64.encode(encrypted_envelope),
        };

        let response = self
            .http
            .put(self.url(&format!("/v1/provisioning/{}", uuid)))
            .basic_auth(self.address.to_string(), Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::RequestFailure(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(true);
        }
        if status == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let body: Value = response.json().await.unwrap_or(Value::Null);
        Err(Error::request_rejected(status.as_u16(), body))
    }

    /// `PUT /v1/devices/<provisioningCode>` (spec.md SS4.7 autoprovision).
    pub async fn link_this_device(
        &self,
        provisioning_code: &str,
        signaling_key: &[u8],
        registration_id: u32,
        name: &str,
    ) -> Result<u32> {
        let body = LinkDeviceRequest {
            signaling_key: BASE64.encode(signaling_key),
            supports_sms: false,
            fetches_messages: true,
            registration_id,
            name: name.to_string(),
        };

        let response = self
            .http
            .put(self.url(&format!("/v1/devices/{}", provisioning_code)))
            .basic_auth(self.address.to_string(), Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::RequestFailure(e.to_string()))?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        let body = Self::check_status(status, body).await?;
        let parsed: LinkDeviceResponse =
            serde_json::from_value(body).map_err(|e| Error::MalformedResponse(e.to_string()))?;
        Ok(parsed.device_id)
    }
}

fn decode_bundle(device: super::models::PreKeyBundleJson, identity_key: IdentityPublicKey) -> Result<PreKeyBundle> {
    let signed_pre_key_public: [u8; 32] = BASE64
        .decode(&device.signed_pre_key.public_key)
        .map_err(|e| Error::MalformedResponse(e.to_string()))?
        .try_into()
        .map_err(|_| Error::InvalidKey("signed prekey must be 32 bytes".into()))?;
    let signed_pre_key_signature: [u8; 64] = BASE64
        .decode(&device.signed_pre_key.signature)
        .map_err(|e| Error::MalformedResponse(e.to_string()))?
        .try_into()
        .map_err(|_| Error::InvalidSignature)?;

    let (pre_key_id, pre_key_public) = match device.pre_key {
        Some(entry) => {
            let bytes: [u8; 32] = BASE64
                .decode(&entry.public_key)
                .map_err(|e| Error::MalformedResponse(e.to_string()))?
                .try_into()
                .map_err(|_| Error::InvalidKey("prekey must be 32 bytes".into()))?;
            (Some(entry.key_id), Some(x25519_dalek::PublicKey::from(bytes)))
        }
        None => (None, None),
    };

    Ok(PreKeyBundle {
        registration_id: device.registration_id,
        device_id: device.device_id,
        pre_key_id,
        pre_key_public,
        signed_pre_key_id: device.signed_pre_key.key_id,
        signed_pre_key_public: x25519_dalek::PublicKey::from(signed_pre_key_public),
        signed_pre_key_signature,
        identity_key,
    })
}
