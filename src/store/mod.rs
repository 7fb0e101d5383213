//! The persistent key-value store boundary (spec.md SS4.1: the raw byte-blob
//! store is an external collaborator). This module defines the trait a real
//! deployment implements (SQLCipher, sled, ...) plus one in-memory reference
//! implementation used by tests and as a default.

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;

pub use memory::MemoryBackend;

/// Logical namespaces [`crate::keystore`] partitions keys into. Kept here
/// since they're part of the storage contract, not keystore-internal detail.
pub mod namespace {
    pub const IDENTITY_KEYS: &str = "identityKey";
    pub const PRE_KEYS: &str = "preKey";
    pub const SIGNED_PRE_KEYS: &str = "signedPreKey";
    pub const SESSIONS: &str = "session";
    pub const TRUST: &str = "identityKeyTrust";
}

/// A namespaced byte-blob store. Keys are scoped to a namespace so different
/// logical record types (sessions, prekeys, trust records, ...) never
/// collide even though they share one physical backend.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn set(&self, namespace: &str, key: &str, value: Vec<u8>) -> Result<()>;
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>>;
    async fn remove(&self, namespace: &str, key: &str) -> Result<()>;
    async fn has(&self, namespace: &str, key: &str) -> Result<bool> {
        Ok(self.get(namespace, key).await?.is_some())
    }
    async fn keys_in_namespace(&self, namespace: &str) -> Result<Vec<String>>;
}
