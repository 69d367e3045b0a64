//! Frame codec
//!
//! Single responsibility: turn a `Request` into a WebSocket frame and back.
//! Text frames carry JSON, binary frames carry MessagePack, optionally
//! LZ4-compressed (`compression` feature).

use serde::{Deserialize, Serialize};

use super::request::Request;
use crate::error::{ClientError, Result};

/// Encoding used for outgoing frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    #[default]
    Json,
    #[value(name = "msgpack")]
    #[serde(rename = "msgpack")]
    MessagePack,
}

/// Compression applied to binary frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    /// Needs the `compression` feature.
    Lz4,
}

/// A serialized request, ready for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// Codec configured per channel at construction.
#[derive(Debug, Clone, Copy, Default)]
pub struct Codec {
    format: Format,
    compression: Compression,
}

impl Codec {
    pub fn new(format: Format, compression: Compression) -> Self {
        Self {
            format,
            compression,
        }
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn encode(&self, request: &Request) -> Result<Frame> {
        match self.format {
            Format::Json => Ok(Frame::Text(serde_json::to_string(request)?)),
            Format::MessagePack => {
                let bytes = rmp_serde::to_vec_named(request)
                    .map_err(|e| ClientError::Codec(format!("Failed to encode MessagePack: {e}")))?;
                Ok(Frame::Binary(self.compress(bytes)?))
            }
        }
    }

    pub fn decode(&self, frame: &Frame) -> Result<Request> {
        match frame {
            Frame::Text(text) => Ok(serde_json::from_str(text)?),
            Frame::Binary(bytes) => {
                let bytes = self.decompress(bytes)?;
                rmp_serde::from_slice(&bytes)
                    .map_err(|e| ClientError::Codec(format!("Failed to decode MessagePack: {e}")))
            }
        }
    }

    fn compress(&self, bytes: Vec<u8>) -> Result<Vec<u8>> {
        match self.compression {
            Compression::None => Ok(bytes),
            #[cfg(feature = "compression")]
            Compression::Lz4 => Ok(lz4_flex::compress_prepend_size(&bytes)),
            #[cfg(not(feature = "compression"))]
            Compression::Lz4 => Err(compression_disabled()),
        }
    }

    fn decompress(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        match self.compression {
            Compression::None => Ok(bytes.to_vec()),
            #[cfg(feature = "compression")]
            Compression::Lz4 => lz4_flex::decompress_size_prepended(bytes)
                .map_err(|e| ClientError::Codec(format!("Failed to decompress frame: {e}"))),
            #[cfg(not(feature = "compression"))]
            Compression::Lz4 => Err(compression_disabled()),
        }
    }
}

#[cfg(not(feature = "compression"))]
fn compression_disabled() -> ClientError {
    ClientError::Codec("lz4 compression requires the `compression` feature".to_string())
}
