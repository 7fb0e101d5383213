//! `(userId, deviceId)` addressing (spec.md SS3 "Address").

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// A single device belonging to a user. The canonical string form is
/// `"<uuid-lowercase>.<device>"`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub user_id: Uuid,
    pub device_id: u32,
}

impl Address {
    pub fn new(user_id: Uuid, device_id: u32) -> Self {
        Self { user_id, device_id }
    }

    /// Parse the canonical `"<uuid>.<device>"` string form.
    pub fn parse(s: &str) -> Result<Self> {
        let (uuid_part, device_part) = s
            .rsplit_once('.')
            .ok_or_else(|| Error::InvalidId(format!("malformed address: {s}")))?;
        let user_id = Uuid::parse_str(uuid_part)
            .map_err(|e| Error::InvalidId(format!("malformed address uuid: {e}")))?;
        let device_id: u32 = device_part
            .parse()
            .map_err(|e| Error::InvalidId(format!("malformed address device id: {e}")))?;
        Ok(Self { user_id, device_id })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}",
            self.user_id.hyphenated().to_string().to_lowercase(),
            self.device_id
        )
    }
}

/// A send target: either one specific device, or every device a user
/// currently has registered (spec.md SS4.5).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Recipient {
    Device(Address),
    User(Uuid),
}

impl Recipient {
    pub fn user_id(&self) -> Uuid {
        match self {
            Recipient::Device(addr) => addr.user_id,
            Recipient::User(id) => *id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_display_and_parse() {
        let addr = Address::new(
            Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap(),
            7,
        );
        let s = addr.to_string();
        assert_eq!(s, "11111111-1111-1111-1111-111111111111.7");
        assert_eq!(Address::parse(&s).unwrap(), addr);
    }

    #[test]
    fn lowercases_mixed_case_uuid_input() {
        let s = "11111111-1111-1111-1111-111111111111.3";
        let addr = Address::parse(s).unwrap();
        assert_eq!(addr.to_string(), s);
    }

    #[test]
    fn rejects_missing_device_separator() {
        assert!(Address::parse("not-an-address").is_err());
    }

    #[quickcheck_macros::quickcheck]
    fn address_round_trip(user_id_bytes: (u64, u64), device_id: u32) -> bool {
        let bytes = {
            let mut b = [0u8; 16];
            b[..8].copy_from_slice(&user_id_bytes.0.to_be_bytes());
            b[8..].copy_from_slice(&user_id_bytes.1.to_be_bytes());
            b
        };
        let addr = Address::new(Uuid::from_bytes(bytes), device_id);
        Address::parse(&addr.to_string()).map(|a| a == addr).unwrap_or(false)
    }
}
