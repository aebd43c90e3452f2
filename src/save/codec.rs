use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use thiserror::Error;

use super::types::{PayloadInfo, StoredPayload};
use crate::error::RawFailure;

pub const GZIP: &str = "gzip";
pub const IDENTITY: &str = "none";

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Compression failed: {0}")]
    Compress(#[source] std::io::Error),

    #[error("Decompression failed: {0}")]
    Decompress(#[source] std::io::Error),

    #[error("Unsupported payload algorithm '{0}'")]
    UnsupportedAlgorithm(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}

impl From<CodecError> for RawFailure {
    fn from(err: CodecError) -> Self {
        let code = match &err {
            CodecError::Compress(_) => "invalid-argument",
            CodecError::Decompress(_) | CodecError::UnsupportedAlgorithm(_) => "data-corrupted",
            CodecError::ChecksumMismatch { .. } => "checksum-mismatch",
        };
        RawFailure::coded(code, err.to_string())
    }
}

/// Turns raw save bytes into a stored payload and back
pub trait SaveCodec: Send + Sync {
    fn encode(&self, raw: &[u8]) -> Result<StoredPayload, CodecError>;

    /// Decompress only; integrity is checked separately with [`SaveCodec::verify`]
    fn decode(&self, payload: &StoredPayload) -> Result<Vec<u8>, CodecError>;

    fn checksum(&self, raw: &[u8]) -> String {
        format!("{:x}", Sha256::digest(raw))
    }

    fn verify(&self, raw: &[u8], expected: &str) -> Result<(), CodecError> {
        let actual = self.checksum(raw);
        if actual == expected {
            Ok(())
        } else {
            Err(CodecError::ChecksumMismatch {
                expected: expected.to_string(),
                actual,
            })
        }
    }
}

/// gzip with SHA-256 over the uncompressed bytes.
/// Also reads payloads written uncompressed (`none`).
#[derive(Debug, Clone, Copy)]
pub struct GzipCodec {
    level: Compression,
}

impl Default for GzipCodec {
    fn default() -> Self {
        Self {
            level: Compression::default(),
        }
    }
}

impl GzipCodec {
    pub fn new(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }
}

impl SaveCodec for GzipCodec {
    fn encode(&self, raw: &[u8]) -> Result<StoredPayload, CodecError> {
        let mut encoder = GzEncoder::new(Vec::new(), self.level);
        encoder.write_all(raw).map_err(CodecError::Compress)?;
        let data = encoder.finish().map_err(CodecError::Compress)?;

        Ok(StoredPayload {
            info: PayloadInfo {
                checksum: self.checksum(raw),
                algorithm: GZIP.to_string(),
                original_size: raw.len() as u64,
                compressed_size: data.len() as u64,
            },
            data,
        })
    }

    fn decode(&self, payload: &StoredPayload) -> Result<Vec<u8>, CodecError> {
        match payload.info.algorithm.as_str() {
            GZIP => {
                let mut raw = Vec::with_capacity(payload.info.original_size as usize);
                GzDecoder::new(payload.data.as_slice())
                    .read_to_end(&mut raw)
                    .map_err(CodecError::Decompress)?;
                Ok(raw)
            }
            IDENTITY => Ok(payload.data.clone()),
            other => Err(CodecError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}
