//! Compression/encryption transformer chain (spec §4.3, design note: "wrapping
//! a Writer applies compression first then encryption, and wrapping a Reader
//! applies decryption first then decompression; NoOp is the identity").

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rand::RngCore;
use std::io::{Read, Write};
use thiserror::Error;

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("compression failed: {0}")]
    Compression(#[from] std::io::Error),
    #[error("encryption failed")]
    Encryption,
    #[error("decryption failed: ciphertext is invalid or the key is wrong")]
    Decryption,
    #[error("ciphertext shorter than the nonce prefix")]
    Truncated,
    #[error("unsupported encryption method: {0}")]
    UnsupportedMethod(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionKind {
    None,
    Gzip { level: u32 },
}

#[derive(Clone)]
pub enum EncryptionKind {
    None,
    Aes128Gcm(Box<Aes128Gcm>),
    Aes256Gcm(Box<Aes256Gcm>),
}

impl EncryptionKind {
    pub fn new(method: &str, key: &[u8]) -> Result<Self, TransformError> {
        match method {
            "aes-128-gcm" => {
                let cipher = Aes128Gcm::new_from_slice(key)
                    .map_err(|_| TransformError::UnsupportedMethod(method.to_string()))?;
                Ok(EncryptionKind::Aes128Gcm(Box::new(cipher)))
            }
            "aes-256-gcm" => {
                let cipher = Aes256Gcm::new_from_slice(key)
                    .map_err(|_| TransformError::UnsupportedMethod(method.to_string()))?;
                Ok(EncryptionKind::Aes256Gcm(Box::new(cipher)))
            }
            other => Err(TransformError::UnsupportedMethod(other.to_string())),
        }
    }
}

/// An ordered compression-then-encryption pair applied on write, and its
/// mirror (decryption-then-decompression) on read. Constructed once per
/// tunnel from the port mapping's `TransformConfig` (spec §3) and shared by
/// both ends via the negotiated `TunnelOpenRequest` body.
#[derive(Clone)]
pub struct Transformer {
    compression: CompressionKind,
    encryption: EncryptionKind,
}

impl Transformer {
    pub const fn identity() -> Self {
        Self {
            compression: CompressionKind::None,
            encryption: EncryptionKind::None,
        }
    }

    pub fn new(compression: CompressionKind, encryption: EncryptionKind) -> Self {
        Self {
            compression,
            encryption,
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self.compression, CompressionKind::None)
            && matches!(self.encryption, EncryptionKind::None)
    }

    pub fn uses_compression(&self) -> bool {
        !matches!(self.compression, CompressionKind::None)
    }

    pub fn uses_encryption(&self) -> bool {
        !matches!(self.encryption, EncryptionKind::None)
    }

    /// Compress, then encrypt.
    pub fn encode(&self, plain: &[u8]) -> Result<Vec<u8>, TransformError> {
        let compressed = match self.compression {
            CompressionKind::None => plain.to_vec(),
            CompressionKind::Gzip { level } => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level));
                encoder.write_all(plain)?;
                encoder.finish()?
            }
        };

        match &self.encryption {
            EncryptionKind::None => Ok(compressed),
            EncryptionKind::Aes128Gcm(cipher) => encrypt_with(cipher.as_ref(), &compressed),
            EncryptionKind::Aes256Gcm(cipher) => encrypt_with(cipher.as_ref(), &compressed),
        }
    }

    /// Decrypt, then decompress.
    pub fn decode(&self, wire: &[u8]) -> Result<Vec<u8>, TransformError> {
        let decrypted = match &self.encryption {
            EncryptionKind::None => wire.to_vec(),
            EncryptionKind::Aes128Gcm(cipher) => decrypt_with(cipher.as_ref(), wire)?,
            EncryptionKind::Aes256Gcm(cipher) => decrypt_with(cipher.as_ref(), wire)?,
        };

        match self.compression {
            CompressionKind::None => Ok(decrypted),
            CompressionKind::Gzip { .. } => {
                let mut decoder = GzDecoder::new(decrypted.as_slice());
                let mut out = Vec::new();
                decoder.read_to_end(&mut out)?;
                Ok(out)
            }
        }
    }
}

fn encrypt_with<C>(cipher: &C, plain: &[u8]) -> Result<Vec<u8>, TransformError>
where
    C: Aead,
{
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let mut ciphertext = cipher
        .encrypt(nonce, plain)
        .map_err(|_| TransformError::Encryption)?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.append(&mut ciphertext);
    Ok(out)
}

fn decrypt_with<C>(cipher: &C, wire: &[u8]) -> Result<Vec<u8>, TransformError>
where
    C: Aead,
{
    if wire.len() < NONCE_LEN {
        return Err(TransformError::Truncated);
    }
    let (nonce_bytes, ciphertext) = wire.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| TransformError::Decryption)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_transformer_round_trips_unchanged() {
        let t = Transformer::identity();
        let plain = b"hello tunnox".to_vec();
        let wire = t.encode(&plain).unwrap();
        assert_eq!(wire, plain);
        assert_eq!(t.decode(&wire).unwrap(), plain);
    }

    #[test]
    fn gzip_only_round_trips() {
        let t = Transformer::new(CompressionKind::Gzip { level: 6 }, EncryptionKind::None);
        let plain = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_vec();
        let wire = t.encode(&plain).unwrap();
        assert_ne!(wire, plain);
        assert_eq!(t.decode(&wire).unwrap(), plain);
    }

    #[test]
    fn aes128_gcm_only_round_trips() {
        let key = [7u8; 16];
        let enc = EncryptionKind::new("aes-128-gcm", &key).unwrap();
        let t = Transformer::new(CompressionKind::None, enc);
        let plain = b"secret payload".to_vec();
        let wire = t.encode(&plain).unwrap();
        assert_ne!(wire, plain);
        assert_eq!(t.decode(&wire).unwrap(), plain);
    }

    #[test]
    fn gzip_then_aes256_gcm_chain_round_trips() {
        let key = [9u8; 32];
        let enc = EncryptionKind::new("aes-256-gcm", &key).unwrap();
        let t = Transformer::new(CompressionKind::Gzip { level: 9 }, enc);
        let plain = b"a chain of transforms applied to this payload, twice over".to_vec();
        let wire = t.encode(&plain).unwrap();
        assert_eq!(t.decode(&wire).unwrap(), plain);
    }

    #[test]
    fn wrong_key_fails_decryption_instead_of_panicking() {
        let enc_a = EncryptionKind::new("aes-128-gcm", &[1u8; 16]).unwrap();
        let enc_b = EncryptionKind::new("aes-128-gcm", &[2u8; 16]).unwrap();
        let t_a = Transformer::new(CompressionKind::None, enc_a);
        let t_b = Transformer::new(CompressionKind::None, enc_b);

        let wire = t_a.encode(b"payload").unwrap();
        assert!(matches!(t_b.decode(&wire), Err(TransformError::Decryption)));
    }

    #[test]
    fn each_encode_call_uses_a_fresh_nonce() {
        let key = [3u8; 16];
        let enc = EncryptionKind::new("aes-128-gcm", &key).unwrap();
        let t = Transformer::new(CompressionKind::None, enc);
        let a = t.encode(b"same plaintext").unwrap();
        let b = t.encode(b"same plaintext").unwrap();
        assert_ne!(a, b);
    }
}
