//! Entity shapes for the data model in spec §3. These are plain,
//! store-agnostic records — the KV store holds their JSON encoding under the
//! flat keys defined in the crate root.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientType {
    Anonymous,
    Registered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientStatus {
    Offline,
    Online,
    Blocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub id: u64,
    /// Empty string for anonymous clients.
    pub user_id: String,
    #[serde(rename = "type")]
    pub client_type: ClientType,
    pub auth_code: String,
    pub secret_key: String,
    /// The server node currently anchoring this client's control connection.
    pub node_id: String,
    pub status: ClientStatus,
}

impl Client {
    pub fn is_online(&self) -> bool {
        self.status == ClientStatus::Online
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortMappingStatus {
    Active,
    Inactive,
}

/// Compression/encryption settings carried by a mapping, mirrored onto the
/// `TunnelOpenRequest` command body (spec §6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransformConfig {
    pub enable_compression: bool,
    pub compression_level: u8,
    pub enable_encryption: bool,
    pub encryption_method: String,
    pub encryption_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMapping {
    pub id: String,
    pub user_id: String,
    pub source_client_id: u64,
    pub target_client_id: u64,
    pub protocol: Protocol,
    pub source_port: u16,
    pub target_host: String,
    pub target_port: u16,
    pub secret_key: String,
    pub status: PortMappingStatus,
    pub transform: TransformConfig,
}

impl PortMapping {
    pub fn is_active(&self) -> bool {
        self.status == PortMappingStatus::Active
    }

    pub fn involves(&self, client_id: u64) -> bool {
        self.source_client_id == client_id || self.target_client_id == client_id
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub address: String,
    pub region: String,
    pub last_seen_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
}
