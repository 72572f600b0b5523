//! The persistent KV store consumed by the tunnel fabric.
//!
//! The store's real implementation is an external collaborator — out of
//! scope per the system spec — so this crate only defines the `KvStore`
//! seam plus the flat key layout (`tunnox:<kind>:<id>`) and an in-memory
//! implementation used by tests and the single-node demo binary.

mod memory;
pub mod model;

pub use memory::MemoryKvStore;
pub use model::{Client, ClientStatus, ClientType, Node, PortMapping, PortMappingStatus, Protocol, TransformConfig, User};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Flat KV interface. Keys follow `tunnox:<kind>:<id>` (see spec §6);
/// callers are responsible for building keys via the helpers in [`model`].
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>) -> StoreResult<()>;
    async fn delete(&self, key: &str) -> StoreResult<()>;
    /// Enumerate all keys under a prefix, e.g. `tunnox:client:` — backs the
    /// "list-index keys as needed for range enumerations" note in spec §6.
    async fn list_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Atomically increment a numeric counter stored at `key`, returning the
    /// post-increment value. Used by the ID manager for KV-backed
    /// cross-restart connection id uniqueness.
    async fn incr(&self, key: &str) -> StoreResult<i64>;
}

/// Typed convenience helpers layered over [`KvStore`] for the entity kinds
/// named in spec §6 (`tunnox:client:<id>`, `tunnox:port_mapping:<id>`, ...).
#[async_trait]
pub trait TypedStore: KvStore {
    async fn get_json<T: serde::de::DeserializeOwned + Send>(
        &self,
        key: &str,
    ) -> StoreResult<Option<T>> {
        match self.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn put_json<T: serde::Serialize + Send + Sync>(
        &self,
        key: &str,
        value: &T,
    ) -> StoreResult<()> {
        self.set(key, serde_json::to_vec(value)?).await
    }
}

impl<T: KvStore + ?Sized> TypedStore for T {}

pub const CLIENT_PREFIX: &str = "tunnox:client:";
pub const PORT_MAPPING_PREFIX: &str = "tunnox:port_mapping:";

pub fn client_key(id: u64) -> String {
    format!("{CLIENT_PREFIX}{id}")
}

pub fn port_mapping_key(id: &str) -> String {
    format!("{PORT_MAPPING_PREFIX}{id}")
}

pub fn node_key(id: &str) -> String {
    format!("tunnox:node:{id}")
}

pub fn user_key(id: &str) -> String {
    format!("tunnox:user:{id}")
}
