//! The directory/identity service surface this core consumes: provisioning
//! UUID exchange, account bootstrap, TURN info (spec.md SS1 "Out of scope":
//! only these endpoints are specified; the rest of Atlas's HTTP surface is
//! an external collaborator).

use std::sync::Mutex;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::{Error, Result};

use super::models::{ProvisionAccountRequest, ProvisionAccountResponse};

#[derive(Debug, Serialize)]
struct BroadcastProvisioningKeyRequest {
    uuid: String,
    #[serde(rename = "pubKey")]
    pub_key: String,
}

#[derive(Debug, Deserialize)]
pub struct TurnInfo {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

pub struct AtlasClient {
    http: Client,
    base_url: String,
    jwt: Mutex<Option<String>>,
}

impl AtlasClient {
    pub fn new(config: &ClientConfig, base_url: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Configuration(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            jwt: Mutex::new(None),
        })
    }

    /// Shared via `Arc<AtlasClient>` across the client facade and the
    /// provisioning engine, so the JWT is behind a lock rather than requiring
    /// `&mut self`.
    pub fn set_jwt(&self, jwt: impl Into<String>) {
        *self.jwt.lock().expect("atlas jwt lock poisoned") = Some(jwt.into());
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let jwt = self.jwt.lock().expect("atlas jwt lock poisoned").clone();
        match jwt {
            Some(jwt) => request.bearer_auth(jwt),
            None => request,
        }
    }

    /// Provision a fresh account on the relay this device should register
    /// against (spec.md SS4.2 `registerAccount`).
    pub async fn provision_account(&self, device_label: &str) -> Result<ProvisionAccountResponse> {
        let response = self
            .authed(self.http.post(self.url("/v1/provision/account")))
            .json(&ProvisionAccountRequest {
                name: device_label.to_string(),
            })
            .send()
            .await
            .map_err(|e| Error::RequestFailure(e.to_string()))?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(Error::request_rejected(status.as_u16(), body));
        }
        serde_json::from_value(body).map_err(|e| Error::MalformedResponse(e.to_string()))
    }

    /// Broadcast `(uuid, ephemeralPublicKey)` to our existing devices so one
    /// of them can answer the autoprovision request (spec.md SS4.7
    /// "New-device role").
    pub async fn broadcast_provisioning_key(&self, uuid: Uuid, ephemeral_public_key: &[u8]) -> Result<()> {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine;

        let response = self
            .authed(self.http.put(self.url(&format!("/v1/provision/request/{}", uuid))))
            .json(&BroadcastProvisioningKeyRequest {
                uuid: uuid.to_string(),
                pub_key: BASE64.encode(ephemeral_public_key),
            })
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

    /// TURN server credentials for call signalling.
    pub async fn turn_info(&self) -> Result<TurnInfo> {
        let response = self
            .authed(self.http.get(self.url("/v1/turn")))
            .send()
            .await
            .map_err(|e| Error::RequestFailure(e.to_string()))?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(Error::request_rejected(status.as_u16(), body));
        }
        serde_json::from_value(body).map_err(|e| Error::MalformedResponse(e.to_string()))
    }

    /// The authenticated user id this JWT belongs to, used by the
    /// autoprovision path's security check (spec.md SS4.7: "Disallow
    /// provisioning if the userId in the envelope differs from the
    /// identity-service's authenticated user id").
    pub async fn authenticated_user_id(&self) -> Result<Uuid> {
        let response = self
            .authed(self.http.get(self.url("/v1/userauth")))
            .send()
            .await
            .map_err(|e| Error::RequestFailure(e.to_string()))?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(Error::request_rejected(status.as_u16(), body));
        }
        body.get("userId")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| Error::MalformedResponse("missing userId".into()))
    }
}
