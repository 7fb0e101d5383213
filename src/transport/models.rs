//! JSON wire DTOs for the Atlas and relay HTTP surfaces (spec.md SS4.2, SS6).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
pub struct ProvisionAccountRequest {
    pub name: String,
}

/// Atlas's response to a provisioning request: the relay URL and the
/// freshly-created `(userId, deviceId)` (spec.md SS4.2 `registerAccount`).
#[derive(Debug, Serialize, Deserialize)]
pub struct ProvisionAccountResponse {
    pub server_url: String,
    pub user_id: Uuid,
    pub device_id: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PreKeyEntryJson {
    #[serde(rename = "keyId")]
    pub key_id: u32,
    #[serde(rename = "publicKey")]
    pub public_key: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SignedPreKeyEntryJson {
    #[serde(rename = "keyId")]
    pub key_id: u32,
    #[serde(rename = "publicKey")]
    pub public_key: String,
    pub signature: String,
}

/// `PUT /v2/keys` body (spec.md SS4.2 `registerAccount`).
#[derive(Debug, Serialize, Deserialize)]
pub struct UploadKeysRequest {
    #[serde(rename = "identityKey")]
    pub identity_key: String,
    #[serde(rename = "preKeys")]
    pub pre_keys: Vec<PreKeyEntryJson>,
    #[serde(rename = "signedPreKey")]
    pub signed_pre_key: SignedPreKeyEntryJson,
}

/// One device's prekey bundle as returned by `GET /v2/keys/<user>/<device>`
/// (spec.md SS4.2 `getKeysForAddr`).
#[derive(Debug, Serialize, Deserialize)]
pub struct PreKeyBundleJson {
    #[serde(rename = "deviceId")]
    pub device_id: u32,
    #[serde(rename = "registrationId")]
    pub registration_id: u32,
    #[serde(rename = "preKey", skip_serializing_if = "Option::is_none")]
    pub pre_key: Option<PreKeyEntryJson>,
    #[serde(rename = "signedPreKey")]
    pub signed_pre_key: SignedPreKeyEntryJson,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KeysForAddrResponse {
    #[serde(rename = "identityKey")]
    pub identity_key: String,
    pub devices: Vec<PreKeyBundleJson>,
}

/// `PUT /v1/messages/<user>/<device>` body (spec.md SS4.2 `deliverToDevice`).
#[derive(Debug, Serialize, Deserialize)]
pub struct OutgoingMessageJson {
    #[serde(rename = "type")]
    pub envelope_type: u32,
    pub content: String,
    #[serde(rename = "destinationRegistrationId")]
    pub destination_registration_id: u32,
    #[serde(rename = "destinationDeviceId")]
    pub destination_device_id: u32,
    pub timestamp: i64,
}

/// `PUT /v1/messages/<user>` body (spec.md SS4.2 `deliverToUser`).
#[derive(Debug, Serialize, Deserialize)]
pub struct OutgoingMessageListJson {
    pub messages: Vec<OutgoingMessageJson>,
    pub timestamp: i64,
}

/// Body of a `409`/`410` user-fan-out response (spec.md SS4.5).
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MismatchedDevicesJson {
    #[serde(default, rename = "extraDevices")]
    pub extra_devices: Vec<u32>,
    #[serde(default, rename = "staleDevices")]
    pub stale_devices: Vec<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProvisioningCodeResponse {
    #[serde(rename = "verificationCode")]
    pub verification_code: String,
}

/// `PUT /v1/devices/<provisioningCode>` body (spec.md SS4.7).
#[derive(Debug, Serialize, Deserialize)]
pub struct LinkDeviceRequest {
    #[serde(rename = "signalingKey")]
    pub signaling_key: String,
    #[serde(rename = "supportsSms")]
    pub supports_sms: bool,
    #[serde(rename = "fetchesMessages")]
    pub fetches_messages: bool,
    #[serde(rename = "registrationId")]
    pub registration_id: u32,
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LinkDeviceResponse {
    #[serde(rename = "deviceId")]
    pub device_id: u32,
}

/// `PUT /v1/provisioning/<uuid>` body (spec.md SS4.7).
#[derive(Debug, Serialize, Deserialize)]
pub struct ProvisioningMessageRequest {
    pub body: String,
}
