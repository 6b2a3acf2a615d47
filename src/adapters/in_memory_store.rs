//! In-memory `RuntimeStore`, used for tests and as a starting point for a
//! real durable backend.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::ports::runtime_store::{RuntimeStore, StoreError};

/// In-memory key/value store. Not durable — intended for tests and for
/// hosts that wire in their own durable adapter.
#[derive(Default)]
pub struct InMemoryRuntimeStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryRuntimeStore {
    /// Construct an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RuntimeStore for InMemoryRuntimeStore {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.entries
            .write()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))?
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .entries
            .read()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))?
            .get(key)
            .cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries
            .write()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))?
            .remove(key);
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .entries
            .read()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))?
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let store = InMemoryRuntimeStore::new();
        store.put("runtime.things.t1", b"{}").await.unwrap();
        assert_eq!(store.get("runtime.things.t1").await.unwrap(), Some(b"{}".to_vec()));
        store.delete("runtime.things.t1").await.unwrap();
        assert_eq!(store.get("runtime.things.t1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_prefix_only_returns_matching_keys() {
        let store = InMemoryRuntimeStore::new();
        store.put("runtime.things.t1", b"1").await.unwrap();
        store.put("runtime.things.t2", b"2").await.unwrap();
        store.put("runtime.certificates.byId.abc", b"3").await.unwrap();

        let mut things = store.list_prefix("runtime.things.").await.unwrap();
        things.sort();
        assert_eq!(things, vec!["runtime.things.t1", "runtime.things.t2"]);
    }
}
