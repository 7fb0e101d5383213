//! Signal-protocol end-to-end encrypted messaging core for Forsta clients.
//!
//! This crate implements the device-side logic of a Forsta messaging
//! client: key management, the Signal double-ratchet session cipher, HTTP
//! clients against the Atlas directory/identity service and the Signal
//! relay, the persistent message socket, and the sender/receiver/
//! provisioning pipelines built on top of them. It owns no UI, storage
//! backend, or transport-security policy beyond what's described below;
//! those are supplied by the host application.

pub mod address;
pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod keystore;
pub mod padding;
pub mod payload;
pub mod provisioning;
pub mod proto;
pub mod receiver;
pub mod registration;
pub mod sender;
pub mod session;
pub mod socket;
pub mod store;
pub mod transport;

pub use address::{Address, Recipient};
pub use client::ForstaClient;
pub use config::ClientConfig;
pub use error::{Error, Result};
pub use events::{Event, EventBus, Observer};
pub use payload::{ControlType, MessageType, Payload};
pub use sender::{SendOptions, TransmissionInfo};
