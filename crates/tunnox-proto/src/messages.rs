//! Command packet and body types carried inside `JsonCommand` frames.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// The command family. Unknown values deserialize to `Unknown(original)`
/// rather than failing — spec §4.2: "unknown command_type is surfaced as
/// Unknown, never fatal at codec level".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandType {
    Authenticate,
    Heartbeat,
    TunnelOpenRequest,
    TunnelOpenResponse,
    PortMapCreate,
    PortMapRemove,
    ConfigGet,
    Disconnect,
    /// Carries a handler's result back to the caller. Kept distinct from
    /// `Disconnect` (the source reused that as a placeholder response type;
    /// see SPEC_FULL.md §9 open-question resolution #2).
    Response,
    /// Server-initiated push of a client's full mapping view (SPEC_FULL.md
    /// §4 C9 supplement). Never sent in reply to a request of this type.
    ConfigSet,
    Unknown(String),
}

impl CommandType {
    fn as_wire_str(&self) -> &str {
        match self {
            CommandType::Authenticate => "authenticate",
            CommandType::Heartbeat => "heartbeat",
            CommandType::TunnelOpenRequest => "tunnel_open_request",
            CommandType::TunnelOpenResponse => "tunnel_open_response",
            CommandType::PortMapCreate => "port_map_create",
            CommandType::PortMapRemove => "port_map_remove",
            CommandType::ConfigGet => "config_get",
            CommandType::Disconnect => "disconnect",
            CommandType::Response => "response",
            CommandType::ConfigSet => "config_set",
            CommandType::Unknown(s) => s.as_str(),
        }
    }

    fn from_wire_str(s: &str) -> Self {
        match s {
            "authenticate" => CommandType::Authenticate,
            "heartbeat" => CommandType::Heartbeat,
            "tunnel_open_request" => CommandType::TunnelOpenRequest,
            "tunnel_open_response" => CommandType::TunnelOpenResponse,
            "port_map_create" => CommandType::PortMapCreate,
            "port_map_remove" => CommandType::PortMapRemove,
            "config_get" => CommandType::ConfigGet,
            "disconnect" => CommandType::Disconnect,
            "response" => CommandType::Response,
            "config_set" => CommandType::ConfigSet,
            other => CommandType::Unknown(other.to_string()),
        }
    }
}

impl Serialize for CommandType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_wire_str())
    }
}

impl<'de> Deserialize<'de> for CommandType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(CommandType::from_wire_str(&s))
    }
}

/// `{ command_type, command_id, token, sender_id, receiver_id, command_body }`
/// (spec §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandPacket {
    pub command_type: CommandType,
    pub command_id: String,
    pub token: String,
    pub sender_id: u64,
    pub receiver_id: u64,
    pub command_body: Value,
}

impl CommandPacket {
    pub fn new(
        command_type: CommandType,
        command_id: impl Into<String>,
        token: impl Into<String>,
        sender_id: u64,
        receiver_id: u64,
        command_body: Value,
    ) -> Self {
        Self {
            command_type,
            command_id: command_id.into(),
            token: token.into(),
            sender_id,
            receiver_id,
            command_body,
        }
    }

    pub fn decode_body<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.command_body.clone())
    }
}

/// What `read_frame`/`write_packet` exchange once decoded from the wire:
/// either a parsed command, a heartbeat marker, or (once a tunnel has
/// switched to raw-byte mode) nothing structured at all.
#[derive(Debug, Clone)]
pub enum TransferPacket {
    Command(CommandPacket),
    Heartbeat,
}

/// `TunnelOpenRequest` command body (spec §6 example). The wire example in
/// the spec omits `protocol`, but the target client has no other way to
/// learn whether to dial its target over TCP or UDP (it never sees the
/// mapping record directly) — so this field is carried here, defaulting to
/// `Tcp` for wire payloads produced before this was added.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelOpenRequestBody {
    pub tunnel_id: String,
    pub mapping_id: String,
    pub secret_key: String,
    #[serde(default = "default_protocol")]
    pub protocol: tunnox_store::Protocol,
    pub target_host: String,
    pub target_port: u16,
    #[serde(default)]
    pub enable_compression: bool,
    #[serde(default)]
    pub compression_level: u8,
    #[serde(default)]
    pub enable_encryption: bool,
    #[serde(default)]
    pub encryption_method: String,
    #[serde(default)]
    pub encryption_key: String,
}

fn default_protocol() -> tunnox_store::Protocol {
    tunnox_store::Protocol::Tcp
}

/// `TunnelOpenResponse` command body — the target side's ack back to the
/// tunnel manager, correlated by `tunnel_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelOpenResponseBody {
    pub tunnel_id: String,
}

/// `Authenticate` command body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticateBody {
    pub auth_code: String,
    pub secret_key: String,
}

/// `PortMapCreate` command body — carries the full record to register.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMapCreateBody {
    pub mapping: tunnox_store::PortMapping,
}

/// `PortMapRemove` command body — references a mapping by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMapRemoveBody {
    pub mapping_id: String,
}

/// `ConfigSet` push (spec §4.9) — the full view of mappings a client should
/// know about, sent as the body of a `Response`-typed command initiated by
/// the server rather than requested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSetBody {
    pub mappings: Vec<tunnox_store::PortMapping>,
}

/// Generic success/failure envelope for `Response`-typed commands (spec
/// §4.8: "CommandCompletedEvent with {..., success, response_body, error,
/// processing_time}" — the wire-level projection of that event).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseBody {
    pub success: bool,
    #[serde(default)]
    pub response_body: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseBody {
    pub fn ok(body: Value) -> Self {
        Self {
            success: true,
            response_body: body,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            response_body: Value::Null,
            error: Some(error.into()),
        }
    }
}
