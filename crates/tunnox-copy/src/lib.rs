//! Bidirectional byte forwarding for an established tunnel (spec §4.12).
//!
//! Two variants share one shape: spawn a task per direction, apply the
//! negotiated [`Transformer`] to whatever crosses the wire, and half-close
//! the peer's write side when a direction's source runs dry so the other
//! direction can keep draining in flight data (spec §8 property 5).
//!
//! The stream variant frames each transformed chunk with a 4-byte length
//! prefix — `Transformer::encode`/`decode` operate on whole buffers (AEAD
//! needs a full ciphertext to find its nonce, gzip needs a full member to
//! decompress), which a continuous unframed byte pipe can't offer once more
//! than one chunk has been written. The packet variant preserves UDP
//! datagram boundaries with the wire's own 2-byte length prefix instead.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use tunnox_stream::{TransformError, Transformer};

#[derive(Debug, Error)]
pub enum CopyError {
    #[error("read failed: {0}")]
    Read(#[source] io::Error),
    #[error("write failed: {0}")]
    Write(#[source] io::Error),
    #[error("write accepted zero bytes of a non-empty buffer")]
    ShortWrite,
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error("oversized transformed frame: {0} bytes exceeds the {1} byte limit")]
    FrameTooLarge(usize, usize),
    #[error("copy task panicked: {0}")]
    Internal(String),
}

/// Byte/error tally for one direction of a stream copy.
#[derive(Debug, Default)]
pub struct DirectionOutcome {
    pub bytes: u64,
    pub error: Option<CopyError>,
}

/// Result of [`copy_bidirectional`]. Mirrors `tokio::io::copy_bidirectional`'s
/// `(u64, u64)` but keeps each direction's terminal error instead of
/// collapsing both into a single `Result`, since spec §8 property 5 expects
/// one direction to keep running after the other's source closes.
#[derive(Debug, Default)]
pub struct CopyOutcome {
    pub a_to_b: DirectionOutcome,
    pub b_to_a: DirectionOutcome,
}

const FRAME_LEN_PREFIX: usize = 4;
const MAX_TRANSFORMED_FRAME: usize = 16 * 1024 * 1024;
const PLAIN_CHUNK: usize = 32 * 1024;

/// Writes `buf` in full, treating a zero-byte successful write as
/// [`CopyError::ShortWrite`] rather than looping forever. `write_all` already
/// retries partial writes internally, but it trusts the writer to never
/// report `Ok(0)` for a non-empty buffer — a trust `AsyncWriteExt::write_all`
/// itself documents as an IO error condition we'd otherwise spin on.
async fn write_all_retrying<W: AsyncWrite + Unpin>(writer: &mut W, mut buf: &[u8]) -> Result<(), CopyError> {
    while !buf.is_empty() {
        let n = writer.write(buf).await.map_err(CopyError::Write)?;
        if n == 0 {
            return Err(CopyError::ShortWrite);
        }
        buf = &buf[n..];
    }
    Ok(())
}

async fn copy_plain<R, W>(reader: &mut R, writer: &mut W) -> Result<u64, CopyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; PLAIN_CHUNK];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await.map_err(CopyError::Read)?;
        if n == 0 {
            return Ok(total);
        }
        write_all_retrying(writer, &buf[..n]).await?;
        total += n as u64;
    }
}

/// Plaintext side reads whole chunks, encodes each with the transformer, and
/// frames the ciphertext with its own length prefix before pushing it into
/// the raw tunnel pipe.
async fn copy_encode<R, W>(reader: &mut R, writer: &mut W, transformer: &Transformer) -> Result<u64, CopyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; PLAIN_CHUNK];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await.map_err(CopyError::Read)?;
        if n == 0 {
            return Ok(total);
        }
        let wire = transformer.encode(&buf[..n])?;
        write_all_retrying(writer, &(wire.len() as u32).to_be_bytes()).await?;
        write_all_retrying(writer, &wire).await?;
        total += n as u64;
    }
}

/// Tunnel side parses `[len][ciphertext]` records back out and writes the
/// decoded plaintext onward. A zero-length record is a clean end-of-direction
/// marker (the encode side never emits one, since an empty `read` already
/// ends its loop without encoding anything).
async fn copy_decode<R, W>(reader: &mut R, writer: &mut W, transformer: &Transformer) -> Result<u64, CopyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    loop {
        let mut len_buf = [0u8; FRAME_LEN_PREFIX];
        match reader.read_exact(&mut len_buf).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(total),
            Err(e) => return Err(CopyError::Read(e)),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            return Ok(total);
        }
        if len > MAX_TRANSFORMED_FRAME {
            return Err(CopyError::FrameTooLarge(len, MAX_TRANSFORMED_FRAME));
        }
        let mut wire = vec![0u8; len];
        reader.read_exact(&mut wire).await.map_err(CopyError::Read)?;
        let plain = transformer.decode(&wire)?;
        write_all_retrying(writer, &plain).await?;
        total += plain.len() as u64;
    }
}

/// Copies bytes between `a` and `b` in both directions until each side's
/// source is exhausted, half-closing the opposite writer as each direction
/// ends. `transformer` is applied identically in both directions — a tunnel
/// has one negotiated transform, not one per leg (spec §6).
pub async fn copy_bidirectional<A, B>(a: A, b: B, transformer: Transformer) -> CopyOutcome
where
    A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut a_r, mut a_w) = tokio::io::split(a);
    let (mut b_r, mut b_w) = tokio::io::split(b);

    let identity = transformer.is_identity();
    let t_a_to_b = transformer.clone();
    let t_b_to_a = transformer;

    let a_to_b = tokio::spawn(async move {
        let result = if identity {
            copy_plain(&mut a_r, &mut b_w).await
        } else {
            copy_encode(&mut a_r, &mut b_w, &t_a_to_b).await
        };
        let _ = b_w.shutdown().await;
        result
    });

    let b_to_a = tokio::spawn(async move {
        let result = if identity {
            copy_plain(&mut b_r, &mut a_w).await
        } else {
            copy_decode(&mut b_r, &mut a_w, &t_b_to_a).await
        };
        let _ = a_w.shutdown().await;
        result
    });

    let (a_to_b, b_to_a) = tokio::join!(a_to_b, b_to_a);

    let mut outcome = CopyOutcome::default();
    match a_to_b {
        Ok(Ok(bytes)) => outcome.a_to_b.bytes = bytes,
        Ok(Err(e)) => outcome.a_to_b.error = Some(e),
        Err(join_err) => outcome.a_to_b.error = Some(CopyError::Internal(join_err.to_string())),
    }
    match b_to_a {
        Ok(Ok(bytes)) => outcome.b_to_a.bytes = bytes,
        Ok(Err(e)) => outcome.b_to_a.error = Some(e),
        Err(join_err) => outcome.b_to_a.error = Some(CopyError::Internal(join_err.to_string())),
    }
    debug!(
        a_to_b_bytes = outcome.a_to_b.bytes,
        b_to_a_bytes = outcome.b_to_a.bytes,
        "tunnel copy finished"
    );
    outcome
}

/// A connected datagram endpoint: `recv`/`send` operate against whatever
/// single peer the endpoint is bound to, matching `UdpSocket::connect`'s
/// contract. Exists so the packet copy variant can be exercised in tests
/// against an in-memory double instead of a real socket.
#[async_trait]
pub trait DatagramEndpoint: Send + Sync {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
    async fn send(&self, buf: &[u8]) -> io::Result<usize>;
}

#[async_trait]
impl DatagramEndpoint for tokio::net::UdpSocket {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        tokio::net::UdpSocket::recv(self, buf).await
    }

    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        tokio::net::UdpSocket::send(self, buf).await
    }
}

/// Datagram/byte tally for one direction of a packet copy.
#[derive(Debug, Default)]
pub struct PacketDirectionOutcome {
    pub datagrams: u64,
    pub bytes: u64,
    pub error: Option<CopyError>,
}

/// Result of [`copy_datagrams`].
#[derive(Debug, Default)]
pub struct PacketCopyOutcome {
    pub udp_to_tunnel: PacketDirectionOutcome,
    pub tunnel_to_udp: PacketDirectionOutcome,
}

/// Largest length a 2-byte big-endian prefix can carry, and the ceiling the
/// spec puts on a single UDP read.
const UDP_DATAGRAM_MAX: usize = u16::MAX as usize;
/// Batch outbound datagrams into the tunnel until this many bytes have
/// accumulated, then flush in one write.
const UDP_BATCH_THRESHOLD: usize = 256 * 1024;
/// How long `udp_to_tunnel` waits for another datagram before flushing
/// whatever's already batched, so a single slow trickle isn't held forever.
const UDP_BATCH_FLUSH_DELAY: std::time::Duration = std::time::Duration::from_millis(5);
/// Read chunk size for the tunnel->UDP direction; records are parsed out of
/// an accumulating buffer so one syscall can yield several datagrams.
const TUNNEL_READ_CHUNK: usize = 512 * 1024;

async fn udp_to_tunnel<U, W>(udp: &U, writer: &mut W) -> (u64, u64, Result<(), CopyError>)
where
    U: DatagramEndpoint + ?Sized,
    W: AsyncWrite + Unpin,
{
    let mut recv_buf = vec![0u8; UDP_DATAGRAM_MAX];
    let mut batch = Vec::with_capacity(UDP_BATCH_THRESHOLD);
    let mut datagrams = 0u64;
    let mut bytes = 0u64;

    loop {
        match tokio::time::timeout(UDP_BATCH_FLUSH_DELAY, udp.recv(&mut recv_buf)).await {
            Ok(Ok(n)) => {
                batch.extend_from_slice(&(n as u16).to_be_bytes());
                batch.extend_from_slice(&recv_buf[..n]);
                datagrams += 1;
                bytes += n as u64;
                if batch.len() >= UDP_BATCH_THRESHOLD {
                    if let Err(e) = write_all_retrying(writer, &batch).await {
                        return (datagrams, bytes, Err(e));
                    }
                    batch.clear();
                }
            }
            // `UnexpectedEof` is the convention a datagram source uses to
            // signal a deliberate close (no analogue to a stream read
            // returning 0) — treated as a graceful end, not a failure.
            Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                if !batch.is_empty() {
                    let _ = write_all_retrying(writer, &batch).await;
                }
                return (datagrams, bytes, Ok(()));
            }
            Ok(Err(e)) => return (datagrams, bytes, Err(CopyError::Read(e))),
            Err(_elapsed) => {
                if !batch.is_empty() {
                    if let Err(e) = write_all_retrying(writer, &batch).await {
                        return (datagrams, bytes, Err(e));
                    }
                    batch.clear();
                }
            }
        }
    }
}

/// Finds the next complete `[2-byte len][payload]` record at the front of
/// `buf`, if one is fully present. Returns `(payload_len, total_consumed)`.
fn try_parse_record(buf: &[u8]) -> Option<(usize, usize)> {
    if buf.len() < 2 {
        return None;
    }
    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if buf.len() < 2 + len {
        return None;
    }
    Some((len, 2 + len))
}

async fn tunnel_to_udp<R, U>(reader: &mut R, udp: &U) -> (u64, u64, Result<(), CopyError>)
where
    R: AsyncRead + Unpin,
    U: DatagramEndpoint + ?Sized,
{
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = vec![0u8; TUNNEL_READ_CHUNK];
    let mut datagrams = 0u64;
    let mut bytes = 0u64;

    loop {
        while let Some((len, consumed)) = try_parse_record(&buf) {
            let payload = buf[consumed - len..consumed].to_vec();
            buf.drain(0..consumed);
            if let Err(e) = udp.send(&payload).await {
                return (datagrams, bytes, Err(CopyError::Write(e)));
            }
            datagrams += 1;
            bytes += len as u64;
        }

        let n = match reader.read(&mut chunk).await {
            Ok(n) => n,
            Err(e) => return (datagrams, bytes, Err(CopyError::Read(e))),
        };
        if n == 0 {
            return (datagrams, bytes, Ok(()));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Forwards datagrams between a connected [`DatagramEndpoint`] and a raw
/// tunnel byte pipe, preserving datagram boundaries with a 2-byte length
/// prefix on the wire (spec §4.12 packet variant, exercised by spec E5).
///
/// A length-0 record is a legitimate empty datagram here, not an
/// end-of-direction marker: the tunnel side only ends on the underlying
/// reader returning EOF. This differs from the stream variant's encoded
/// framing, where a 0 length is unambiguous because `copy_encode` never
/// emits an empty frame for an empty read.
pub async fn copy_datagrams<U, T>(udp: Arc<U>, tunnel: T) -> PacketCopyOutcome
where
    U: DatagramEndpoint + 'static,
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut tunnel_r, mut tunnel_w) = tokio::io::split(tunnel);

    let udp_up = udp.clone();
    let up_task = tokio::spawn(async move {
        let result = udp_to_tunnel(udp_up.as_ref(), &mut tunnel_w).await;
        let _ = tunnel_w.shutdown().await;
        result
    });

    let down_task = tokio::spawn(async move { tunnel_to_udp(&mut tunnel_r, udp.as_ref()).await });

    let (up, down) = tokio::join!(up_task, down_task);

    let mut outcome = PacketCopyOutcome::default();
    match up {
        Ok((datagrams, bytes, result)) => {
            outcome.udp_to_tunnel.datagrams = datagrams;
            outcome.udp_to_tunnel.bytes = bytes;
            outcome.udp_to_tunnel.error = result.err();
        }
        Err(join_err) => outcome.udp_to_tunnel.error = Some(CopyError::Internal(join_err.to_string())),
    }
    match down {
        Ok((datagrams, bytes, result)) => {
            outcome.tunnel_to_udp.datagrams = datagrams;
            outcome.tunnel_to_udp.bytes = bytes;
            outcome.tunnel_to_udp.error = result.err();
        }
        Err(join_err) => outcome.tunnel_to_udp.error = Some(CopyError::Internal(join_err.to_string())),
    }
    outcome
}
