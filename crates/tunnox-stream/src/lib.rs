//! Packet stream: a full-duplex byte pipe plus a [`Transformer`], framing
//! `TransferPacket`s on top of `tunnox_proto`'s frame codec (spec §4.3).
//!
//! Single-producer/single-consumer in each direction: concurrent reads are
//! not supported, but a read and a write may proceed concurrently (matches
//! `tokio::io::split`'s half ownership). [`PacketStream::split`] hands out
//! that concurrency directly as a [`PacketReader`]/[`PacketWriter`] pair —
//! the session manager (C7) keeps the reader in its per-connection read
//! task and shares the writer with the response router (C8) so a command
//! reply can be written while the next frame is still being read.

pub mod transform;

pub use transform::{CompressionKind, EncryptionKind, TransformError, Transformer};

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::trace;

use tunnox_proto::{build_frame, read_frame, CommandPacket, PacketType, TransferPacket};

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("connection closed")]
    Eof,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Codec(#[from] tunnox_proto::CodecError),
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error("write_packet timed out before the deadline")]
    DeadlineExceeded,
}

impl From<StreamError> for std::io::Error {
    fn from(e: StreamError) -> Self {
        match e {
            StreamError::Io(e) => e,
            other => std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
        }
    }
}

/// The read half of a packet stream. Owns `R` outright — there is no
/// shared-ownership story for reading, matching the spec's
/// single-producer/single-consumer rule per direction.
pub struct PacketReader<R> {
    reader: R,
    transformer: Transformer,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    /// Reads one frame and reverses any transforms the flags declare, then
    /// parses the body as a [`TransferPacket`].
    pub async fn read_packet(&mut self) -> Result<(TransferPacket, usize), StreamError> {
        let (packet_type, body) = match read_frame(&mut self.reader).await {
            Ok(v) => v,
            Err(tunnox_proto::CodecError::Eof) => return Err(StreamError::Eof),
            Err(e) => return Err(e.into()),
        };
        let read = 5 + body.len();

        let body = if packet_type.has(PacketType::COMPRESSED) || packet_type.has(PacketType::ENCRYPTED)
        {
            self.transformer.decode(&body)?
        } else {
            body
        };

        if packet_type.has(PacketType::HEARTBEAT) {
            return Ok((TransferPacket::Heartbeat, read));
        }
        if packet_type.has(PacketType::JSON_COMMAND) {
            let command: CommandPacket = serde_json::from_slice(&body).map_err(|e| {
                StreamError::Protocol(format!("command body failed to parse: {e}"))
            })?;
            return Ok((TransferPacket::Command(command), read));
        }

        Err(StreamError::Protocol(format!(
            "frame type {:#x} carries neither a heartbeat nor a JSON command",
            packet_type.bits()
        )))
    }

    /// Raw accessor used once a handshake (spec §6, `TunnelOpenRequest` /
    /// `TunnelOpenResponse`) switches the connection from framed control
    /// traffic to a raw byte tunnel, handed to the copy engine.
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    /// Unwraps the raw reader, discarding the transformer. The tunnel
    /// manager re-derives a transformer from the mapping's transform config
    /// rather than reusing this one, since the two legs of a tunnel can
    /// have independent settings.
    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// The write half of a packet stream. Cheap to put behind a `Mutex` and
/// share between a connection's owner and a response router.
pub struct PacketWriter<W> {
    writer: W,
    transformer: Transformer,
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    /// Encodes `packet`, applies the transformer when it isn't the identity,
    /// and writes a single frame. Returns the number of bytes written to the
    /// underlying pipe (frame header included). `flush_hint` advises an
    /// immediate flush; it's honored today since every write already
    /// flushes, but kept as a parameter so a future buffered adapter can act
    /// on it.
    pub async fn write_packet(
        &mut self,
        packet: &TransferPacket,
        _flush_hint: bool,
        deadline: Option<Duration>,
    ) -> Result<usize, StreamError> {
        let fut = self.write_packet_inner(packet);
        match deadline {
            Some(d) => timeout(d, fut).await.map_err(|_| StreamError::DeadlineExceeded)?,
            None => fut.await,
        }
    }

    async fn write_packet_inner(&mut self, packet: &TransferPacket) -> Result<usize, StreamError> {
        let mut packet_type = PacketType::new();

        let body = match packet {
            TransferPacket::Heartbeat => {
                packet_type = packet_type.with(PacketType::HEARTBEAT);
                Vec::new()
            }
            TransferPacket::Command(command) => {
                packet_type = packet_type.with(PacketType::JSON_COMMAND);
                serde_json::to_vec(command)
                    .map_err(|e| StreamError::Protocol(format!("command encoding failed: {e}")))?
            }
        };

        let body = if self.transformer.is_identity() || body.is_empty() {
            body
        } else {
            if self.transformer.uses_compression() {
                packet_type = packet_type.with(PacketType::COMPRESSED);
            }
            if self.transformer.uses_encryption() {
                packet_type = packet_type.with(PacketType::ENCRYPTED);
            }
            self.transformer.encode(&body)?
        };

        let written = 5 + body.len();
        build_frame(&mut self.writer, packet_type, &body).await?;
        trace!(bytes = written, "wrote packet");
        Ok(written)
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    /// Shuts the write side down. Used both for an orderly close and for a
    /// half-close handoff into the copy engine.
    pub async fn close(mut self) -> Result<(), StreamError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Wraps a reader half and a writer half plus the transformer negotiated
/// for this tunnel. `R`/`W` are typically the two halves of `tokio::io::split`
/// over whatever `tunnox_transport` adapter accepted the connection.
pub struct PacketStream<R, W> {
    reader: PacketReader<R>,
    writer: PacketWriter<W>,
}

impl<R, W> PacketStream<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, transformer: Transformer) -> Self {
        Self {
            reader: PacketReader {
                reader,
                transformer: transformer.clone(),
            },
            writer: PacketWriter { writer, transformer },
        }
    }

    pub async fn write_packet(
        &mut self,
        packet: &TransferPacket,
        flush_hint: bool,
        deadline: Option<Duration>,
    ) -> Result<usize, StreamError> {
        self.writer.write_packet(packet, flush_hint, deadline).await
    }

    pub async fn read_packet(&mut self) -> Result<(TransferPacket, usize), StreamError> {
        self.reader.read_packet().await
    }

    /// Raw accessors used once a handshake switches the stream from framed
    /// mode to raw-byte tunnel mode.
    pub fn get_reader(&mut self) -> &mut R {
        self.reader.get_mut()
    }

    pub fn get_writer(&mut self) -> &mut W {
        self.writer.get_mut()
    }

    pub fn into_halves(self) -> (R, W) {
        (self.reader.into_inner(), self.writer.into_inner())
    }

    /// Splits into independently-owned reader/writer halves so a read loop
    /// and a concurrent writer (e.g. a command response router) can each
    /// hold one without sharing a lock over the whole stream.
    pub fn split(self) -> (PacketReader<R>, PacketWriter<W>) {
        (self.reader, self.writer)
    }

    /// Shuts the write half down; the read half is simply dropped along
    /// with `self`.
    pub async fn close(self) -> Result<(), StreamError> {
        self.writer.close().await
    }
}
