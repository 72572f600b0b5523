use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::trace;

use crate::{KvStore, StoreResult};

/// In-memory `KvStore` used by tests and the single-node demo binary. Not a
/// production persistence layer — the spec treats the store's real
/// implementation as opaque.
#[derive(Default)]
pub struct MemoryKvStore {
    data: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.data.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> StoreResult<()> {
        trace!(key, "kv set");
        self.data.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        trace!(key, "kv delete");
        self.data.lock().unwrap().remove(key);
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .data
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        let mut data = self.data.lock().unwrap();
        let current = data
            .get(key)
            .and_then(|b| std::str::from_utf8(b).ok())
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + 1;
        data.insert(key.to_string(), next.to_string().into_bytes());
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_roundtrips() {
        let store = MemoryKvStore::new();
        store.set("tunnox:client:1", b"hello".to_vec()).await.unwrap();
        assert_eq!(
            store.get("tunnox:client:1").await.unwrap(),
            Some(b"hello".to_vec())
        );
    }

    #[tokio::test]
    async fn delete_removes_key() {
        let store = MemoryKvStore::new();
        store.set("k", b"v".to_vec()).await.unwrap();
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_prefix_filters() {
        let store = MemoryKvStore::new();
        store.set("tunnox:client:1", vec![]).await.unwrap();
        store.set("tunnox:client:2", vec![]).await.unwrap();
        store.set("tunnox:node:a", vec![]).await.unwrap();

        let mut keys = store.list_prefix("tunnox:client:").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["tunnox:client:1", "tunnox:client:2"]);
    }

    #[tokio::test]
    async fn incr_is_monotonic() {
        let store = MemoryKvStore::new();
        assert_eq!(store.incr("counter").await.unwrap(), 1);
        assert_eq!(store.incr("counter").await.unwrap(), 2);
        assert_eq!(store.incr("counter").await.unwrap(), 3);
    }
}
