//! ID generation for clients, connections, mappings and tunnels.
//!
//! Connection IDs need cross-restart uniqueness (a client reconnecting after
//! a server restart must not collide with a still-live connection id from
//! before the restart), so they're backed by the KV store's atomic counter.
//! Everything else only needs to be unique within a process lifetime and is
//! generated from a CSPRNG, safe under concurrent calls.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use tunnox_store::KvStore;

const CLIENT_ID_COUNTER_KEY: &str = "tunnox:counter:client_id";
const CONNECTION_ID_COUNTER_KEY: &str = "tunnox:counter:connection_id";

/// Generates identifiers. Cheap to clone; holds only an `Arc` to the store.
#[derive(Clone)]
pub struct IdManager {
    store: Arc<dyn KvStore>,
}

impl IdManager {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// 8-digit numeric client id (10000000..=99999999), cross-restart unique
    /// via the store's counter.
    pub async fn next_client_id(&self) -> tunnox_store::StoreResult<u64> {
        let n = self.store.incr(CLIENT_ID_COUNTER_KEY).await?;
        Ok(10_000_000 + (n as u64 % 90_000_000))
    }

    /// 64-bit signed connection id, cross-restart unique via the store's
    /// counter (spec §3: control connection attribute).
    pub async fn next_connection_id(&self) -> tunnox_store::StoreResult<i64> {
        self.store.incr(CONNECTION_ID_COUNTER_KEY).await
    }

    /// 12-character mapping id, process-lifetime unique, CSPRNG-backed.
    pub fn next_mapping_id(&self) -> String {
        random_alnum(12)
    }

    /// UUID-v4 tunnel id.
    pub fn next_tunnel_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Time-ordered token of the form `prefix<milli-timestamp>_<random>`,
    /// used for short-lived correlation tokens (auth codes, bridge request
    /// ids).
    pub fn next_token(&self, prefix: &str) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        format!("{prefix}{millis}_{}", random_alnum(8))
    }
}

fn random_alnum(len: usize) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}
