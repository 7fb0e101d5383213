//! The typed application payload carried inside every data message (spec.md
//! SS3 "Payload", SS4.4, SS6 "Control message sub-types").
//!
//! Encoded on the wire as a single-element JSON array (historical
//! compatibility with the source format) whose one element is this object.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};

pub const PAYLOAD_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    Content,
    Control,
    Poll,
    PollResponse,
}

/// Wire-level control sub-types (spec.md SS6).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ControlType {
    ThreadUpdate,
    ThreadClear,
    ThreadArchive,
    ThreadRestore,
    ThreadDelete,
    ReadMark,
    PendingMessage,
    Snooze,
    ProvisionRequest,
    SyncRequest,
    SyncResponse,
    DiscoverRequest,
    DiscoverResponse,
    PreMessageCheck,
    AclRequest,
    AclResponse,
    UserBlock,
    UserUnblock,
    Beacon,
    CloseSession,
    CallJoin,
    CallLeave,
    CallOffer,
    CallAcceptOffer,
    #[serde(rename = "callICECandidates")]
    CallIceCandidates,
    CallHeartbeat,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Distribution {
    pub expression: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentMeta {
    pub name: Option<String>,
    pub size: Option<u64>,
    #[serde(rename = "type")]
    pub content_type: Option<String>,
}

/// The application JSON document itself (spec.md SS3 "Payload").
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    pub version: u32,
    pub message_id: Uuid,
    pub message_type: MessageType,
    pub thread_id: Uuid,
    pub distribution: Distribution,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_ref: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_type: Option<ControlType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_plain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_html: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<AttachmentMeta>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default)]
    pub sent_at: Option<i64>,
}

impl Payload {
    pub fn new(message_type: MessageType, thread_id: Uuid, distribution_expression: impl Into<String>) -> Self {
        Self {
            version: PAYLOAD_VERSION,
            message_id: Uuid::new_v4(),
            message_type,
            thread_id,
            distribution: Distribution {
                expression: distribution_expression.into(),
            },
            message_ref: None,
            sender: None,
            thread_title: None,
            thread_type: None,
            control_type: None,
            body_plain: None,
            body_html: None,
            attachments: None,
            data: None,
            sent_at: Some(Utc::now().timestamp_millis()),
        }
    }

    /// `sanityCheck` (spec.md SS4.4): fails when required fields are absent,
    /// or `control`/`controlType` disagree, or an HTML body rides without a
    /// plain fallback.
    pub fn sanity_check(&self) -> Result<()> {
        if self.version != PAYLOAD_VERSION {
            return Err(Error::InvalidPayload(format!("unsupported version {}", self.version)));
        }
        if self.distribution.expression.trim().is_empty() {
            return Err(Error::InvalidPayload("missing distribution.expression".into()));
        }

        match (self.message_type, self.control_type) {
            (MessageType::Control, None) => {
                return Err(Error::InvalidPayload("messageType=control requires controlType".into()))
            }
            (other, Some(_)) if other != MessageType::Control => {
                return Err(Error::InvalidPayload("controlType set without messageType=control".into()))
            }
            _ => {}
        }

        if self.body_html.is_some() && self.body_plain.is_none() {
            return Err(Error::InvalidPayload("html body without a plain body".into()));
        }

        Ok(())
    }

    /// Encode as the historical one-element JSON array, lowercasing UUID
    /// fields (spec.md SS4.4).
    pub fn encode(&self) -> Result<String> {
        self.sanity_check()?;
        let value = serde_json::to_value(self).map_err(|e| Error::InvalidPayload(e.to_string()))?;
        serde_json::to_string(&[value]).map_err(|e| Error::InvalidPayload(e.to_string()))
    }

    pub fn decode(encoded: &str) -> Result<Self> {
        let mut array: Vec<Payload> =
            serde_json::from_str(encoded).map_err(|e| Error::InvalidPayload(e.to_string()))?;
        if array.len() != 1 {
            return Err(Error::InvalidPayload("expected a one-element payload array".into()));
        }
        let payload = array.remove(0);
        payload.sanity_check()?;
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_payload() -> Payload {
        Payload::new(MessageType::Content, Uuid::new_v4(), "@a + @b")
    }

    #[test]
    fn sanity_check_passes_for_minimal_content_message() {
        assert!(valid_payload().sanity_check().is_ok());
    }

    #[test]
    fn sanity_check_rejects_missing_distribution() {
        let mut payload = valid_payload();
        payload.distribution.expression.clear();
        assert!(payload.sanity_check().is_err());
    }

    #[test]
    fn sanity_check_rejects_control_without_control_type() {
        let mut payload = valid_payload();
        payload.message_type = MessageType::Control;
        assert!(matches!(payload.sanity_check(), Err(Error::InvalidPayload(_))));
    }

    #[test]
    fn sanity_check_rejects_control_type_on_non_control_message() {
        let mut payload = valid_payload();
        payload.control_type = Some(ControlType::ReadMark);
        assert!(payload.sanity_check().is_err());
    }

    #[test]
    fn sanity_check_rejects_html_without_plain_fallback() {
        let mut payload = valid_payload();
        payload.body_html = Some("<b>hi</b>".to_string());
        assert!(payload.sanity_check().is_err());
    }

    #[test]
    fn encode_decode_round_trips() {
        let mut payload = valid_payload();
        payload.body_plain = Some("hello".to_string());
        let encoded = payload.encode().unwrap();
        assert!(encoded.starts_with('['));

        let decoded = Payload::decode(&encoded).unwrap();
        assert_eq!(decoded.message_id, payload.message_id);
        assert_eq!(decoded.thread_id, payload.thread_id);
    }

    #[test]
    fn decode_rejects_non_single_element_array() {
        assert!(Payload::decode("[]").is_err());
    }
}
