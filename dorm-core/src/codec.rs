//! Snapshot codec
//!
//! Turns an entity graph into an opaque byte buffer and back. The buffer is
//! the "before" image a scope diffs against, so a restore must reproduce the
//! graph exactly.

use crate::error::Result;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Compression applied to snapshot buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Compression {
    #[default]
    None,
    Zstd,
}

/// bincode-based snapshot codec
#[derive(Debug, Clone, Copy)]
pub struct SnapshotCodec {
    compression: Compression,
    level: i32,
}

impl SnapshotCodec {
    pub fn new(compression: Compression, level: i32) -> Self {
        Self { compression, level }
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Capture an entity graph
    pub fn snapshot<T: Serialize>(&self, entity: &T) -> Result<Bytes> {
        let raw = bincode::serialize(entity)?;
        let data = match self.compression {
            Compression::None => raw,
            Compression::Zstd => zstd::encode_all(raw.as_slice(), self.level)?,
        };
        Ok(Bytes::from(data))
    }

    /// Rebuild an entity graph from a snapshot buffer
    pub fn restore<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        match self.compression {
            Compression::None => Ok(bincode::deserialize(data)?),
            Compression::Zstd => {
                let raw = zstd::decode_all(data)?;
                Ok(bincode::deserialize(&raw)?)
            }
        }
    }
}

impl Default for SnapshotCodec {
    fn default() -> Self {
        Self::new(Compression::None, 3)
    }
}
