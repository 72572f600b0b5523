//! Framed packet codec and control-plane command types (spec §4.2, §6).
//!
//! Wire format, one frame: `[1 byte type][4 bytes big-endian body length][body]`.
//! `type` is a bitfield of flags (see [`PacketType`]); the command family
//! (auth, heartbeat, tunnel-open, port-map, config-get, responses, ...) is
//! carried as a [`CommandType`] discriminant *inside* the JSON body of a
//! `JsonCommand`-flagged frame, not as separate packet-type bits — see
//! DESIGN.md for why.

pub mod codec;
pub mod messages;

pub use codec::{build_frame, read_frame, CodecError, PacketType};
pub use messages::*;

use tokio::io::{AsyncRead, AsyncWrite};

/// Frames larger than this fail with `ProtocolError` at the codec layer.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Serializes a `CommandPacket` and writes it as a single JSON-command
/// frame.
pub async fn build_command<W: AsyncWrite + Unpin>(
    writer: &mut W,
    command: &CommandPacket,
) -> Result<(), CodecError> {
    let body = serde_json::to_vec(command)
        .map_err(|e| CodecError::Protocol(format!("command serialization failed: {e}")))?;
    build_frame(writer, PacketType::new().with(PacketType::JSON_COMMAND), &body).await
}

/// Writes a bare heartbeat frame (no body).
pub async fn build_heartbeat<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<(), CodecError> {
    build_frame(writer, PacketType::new().with(PacketType::HEARTBEAT), &[]).await
}

/// Reads one frame and interprets it as a [`TransferPacket`]: a heartbeat
/// marker, a parsed command, or (for raw post-handshake tunnel traffic)
/// the frame's type and body handed back unparsed.
pub async fn build_transfer<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<TransferPacket, CodecError> {
    let (packet_type, body) = read_frame(reader).await?;
    if packet_type.has(PacketType::HEARTBEAT) {
        return Ok(TransferPacket::Heartbeat);
    }
    if packet_type.has(PacketType::JSON_COMMAND) {
        let command: CommandPacket = serde_json::from_slice(&body)
            .map_err(|e| CodecError::Protocol(format!("command deserialization failed: {e}")))?;
        return Ok(TransferPacket::Command(command));
    }
    Err(CodecError::Protocol(format!(
        "frame type {:#x} is neither a heartbeat nor a JSON command",
        packet_type.bits()
    )))
}

#[cfg(test)]
mod integration_tests {
    use super::*;

    #[tokio::test]
    async fn command_round_trips_through_build_command_and_build_transfer() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let command = CommandPacket::new(
            CommandType::Authenticate,
            "cmd-9",
            "tok",
            1,
            2,
            serde_json::json!({"auth_code": "abc", "secret_key": "xyz"}),
        );

        build_command(&mut client, &command).await.unwrap();
        match build_transfer(&mut server).await.unwrap() {
            TransferPacket::Command(got) => {
                assert_eq!(got.command_type, CommandType::Authenticate);
                assert_eq!(got.command_id, "cmd-9");
            }
            TransferPacket::Heartbeat => panic!("expected a command, got a heartbeat"),
        }
    }

    #[tokio::test]
    async fn heartbeat_round_trips() {
        let (mut client, mut server) = tokio::io::duplex(64);
        build_heartbeat(&mut client).await.unwrap();
        assert!(matches!(
            build_transfer(&mut server).await.unwrap(),
            TransferPacket::Heartbeat
        ));
    }
}
