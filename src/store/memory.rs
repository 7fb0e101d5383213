//! In-memory [`super::StorageBackend`] reference implementation. Good enough
//! for tests and for embedding this crate in a process with no persistence
//! requirement; a real deployment swaps this for SQLCipher, sled, etc.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::Result;
use crate::store::StorageBackend;

#[derive(Default)]
pub struct MemoryBackend {
    data: RwLock<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn set(&self, namespace: &str, key: &str, value: Vec<u8>) -> Result<()> {
        self.data
            .write()
            .expect("memory backend lock poisoned")
            .insert((namespace.to_string(), key.to_string()), value);
        Ok(())
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .data
            .read()
            .expect("memory backend lock poisoned")
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    async fn remove(&self, namespace: &str, key: &str) -> Result<()> {
        self.data
            .write()
            .expect("memory backend lock poisoned")
            .remove(&(namespace.to_string(), key.to_string()));
        Ok(())
    }

    async fn keys_in_namespace(&self, namespace: &str) -> Result<Vec<String>> {
        Ok(self
            .data
            .read()
            .expect("memory backend lock poisoned")
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, key)| key.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_remove_round_trip() {
        let backend = MemoryBackend::new();
        backend.set("ns", "a", vec![1, 2, 3]).await.unwrap();
        assert_eq!(backend.get("ns", "a").await.unwrap(), Some(vec![1, 2, 3]));
        assert!(backend.has("ns", "a").await.unwrap());

        backend.remove("ns", "a").await.unwrap();
        assert_eq!(backend.get("ns", "a").await.unwrap(), None);
        assert!(!backend.has("ns", "a").await.unwrap());
    }

    #[tokio::test]
    async fn keys_in_namespace_are_scoped() {
        let backend = MemoryBackend::new();
        backend.set("a", "one", vec![]).await.unwrap();
        backend.set("a", "two", vec![]).await.unwrap();
        backend.set("b", "three", vec![]).await.unwrap();

        let mut keys = backend.keys_in_namespace("a").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["one".to_string(), "two".to_string()]);
    }
}
