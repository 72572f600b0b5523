//! Frame-level codec: `[1 byte type][4 bytes big-endian body length][body]`.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::MAX_FRAME_SIZE;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("connection closed before a complete frame was read")]
    Eof,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Bitfield describing how a frame's body should be interpreted. Built the
/// same way the upstream framing layer builds its flag byte: start from
/// `PacketType::new()` and `|`-in the bits that apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketType(u8);

impl PacketType {
    pub const JSON_COMMAND: u8 = 0b0000_0001;
    pub const COMPRESSED: u8 = 0b0000_0010;
    pub const ENCRYPTED: u8 = 0b0000_0100;
    pub const HEARTBEAT: u8 = 0b0000_1000;

    pub const fn new() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn with(mut self, bit: u8) -> Self {
        self.0 |= bit;
        self
    }

    pub const fn has(&self, bit: u8) -> bool {
        self.0 & bit == bit
    }

    pub const fn bits(&self) -> u8 {
        self.0
    }
}

/// Writes one frame: type byte, then a big-endian `u32` length, then body.
pub async fn build_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    packet_type: PacketType,
    body: &[u8],
) -> Result<(), CodecError> {
    if body.len() as u64 > MAX_FRAME_SIZE as u64 {
        return Err(CodecError::Protocol(format!(
            "frame body of {} bytes exceeds max frame size {}",
            body.len(),
            MAX_FRAME_SIZE
        )));
    }
    writer.write_u8(packet_type.bits()).await?;
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame, returning its type and body. Returns `CodecError::Eof`
/// if the connection closes before the type byte is read — a clean
/// shutdown between frames, not a protocol violation. Any other truncation
/// (partway through the length or body) surfaces as `CodecError::Io`.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<(PacketType, Vec<u8>), CodecError> {
    let packet_type = match reader.read_u8().await {
        Ok(b) => PacketType::from_bits(b),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(CodecError::Eof),
        Err(e) => return Err(e.into()),
    };

    let len = reader.read_u32().await?;
    if len > MAX_FRAME_SIZE {
        return Err(CodecError::Protocol(format!(
            "frame declares body of {len} bytes, exceeding max frame size {MAX_FRAME_SIZE}"
        )));
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok((packet_type, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_type_bit_composition() {
        let pt = PacketType::new()
            .with(PacketType::JSON_COMMAND)
            .with(PacketType::COMPRESSED);
        assert!(pt.has(PacketType::JSON_COMMAND));
        assert!(pt.has(PacketType::COMPRESSED));
        assert!(!pt.has(PacketType::ENCRYPTED));
    }

    #[tokio::test]
    async fn frame_round_trips_through_an_in_memory_pipe() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let body = b"hello tunnox".to_vec();
        let pt = PacketType::new().with(PacketType::JSON_COMMAND);
        build_frame(&mut client, pt, &body).await.unwrap();

        let (read_pt, read_body) = read_frame(&mut server).await.unwrap();
        assert_eq!(read_pt, pt);
        assert_eq!(read_body, body);
    }

    #[tokio::test]
    async fn empty_body_round_trips() {
        let (mut client, mut server) = tokio::io::duplex(64);
        build_frame(&mut client, PacketType::new().with(PacketType::HEARTBEAT), &[])
            .await
            .unwrap();
        let (pt, body) = read_frame(&mut server).await.unwrap();
        assert!(pt.has(PacketType::HEARTBEAT));
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn clean_close_before_any_bytes_is_eof_not_an_error() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, CodecError::Eof));
    }

    #[tokio::test]
    async fn oversized_declared_length_is_rejected_before_allocating() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_u8(0).await.unwrap();
        client.write_u32(MAX_FRAME_SIZE + 1).await.unwrap();
        client.flush().await.unwrap();

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, CodecError::Protocol(_)));
    }
}
