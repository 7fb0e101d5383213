//! Error taxonomy for the messaging core.
//!
//! `spec.md` SS7 fixes a wire-level set of error names that callers are
//! expected to match on (`untrustedIdentity`, `requestRejected`, ...). This
//! enum is that taxonomy; nothing in this crate should surface a bare string
//! or an opaque boxed error to a caller.

use crate::address::Address;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("duplicate message")]
    DuplicateMessage,

    #[error("invalid type: {0}")]
    InvalidType(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid iv")]
    InvalidIv,

    #[error("invalid id: {0}")]
    InvalidId(String),

    #[error("invalid mac")]
    InvalidMac,

    #[error("invalid hash")]
    InvalidHash,

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("invalid length")]
    InvalidLength,

    #[error("legacy message unsupported")]
    LegacyMessage,

    #[error("no session for {0}")]
    NoSession(Address),

    /// Carries the address and the previously-trusted identity key bytes so
    /// the caller's identity-change observer has everything it needs.
    #[error("untrusted identity for {address}")]
    UntrustedIdentity {
        address: Address,
        identity_key: Vec<u8>,
    },

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid protobuf: {0}")]
    InvalidProtoBuf(String),

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("decryption error: {0}")]
    Decryption(String),

    #[error("request failed: {0}")]
    RequestFailure(String),

    #[error("request rejected with status {status}")]
    RequestRejected {
        status: u16,
        body: serde_json::Value,
    },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("transmission failed: {0}")]
    TransmissionFailure(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("canceled")]
    Canceled,

    #[error("unknown error: {0}")]
    Unknown(String),
}

impl Error {
    pub fn untrusted_identity(address: Address, identity_key: impl Into<Vec<u8>>) -> Self {
        Error::UntrustedIdentity {
            address,
            identity_key: identity_key.into(),
        }
    }

    pub fn request_rejected(status: u16, body: serde_json::Value) -> Self {
        Error::RequestRejected { status, body }
    }

    /// True for the relay status codes §4.5/§4.6 treat as recoverable
    /// (stale-device and extra-device fan-out responses).
    pub fn is_stale_devices_status(status: u16) -> bool {
        status == 410
    }

    pub fn is_extra_devices_status(status: u16) -> bool {
        status == 409
    }
}

pub type Result<T> = std::result::Result<T, Error>;
