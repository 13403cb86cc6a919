use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::compression::{Compressor, Lz4Compression, NONE, NoCompression};
use super::errors::MessageError;

/// Payloads smaller than this are sent uncompressed.
pub const MIN_SIZE_TO_COMPRESS: usize = 1024;

/// What actually crosses the wire: the tag of the compressor that produced
/// `payload`, and the payload itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub compression: String,
    pub payload: Vec<u8>,
}

/// Packs values into tagged envelopes and back.
///
/// Values are encoded with bincode. The encoded bytes are compressed with the
/// configured algorithm only when they reach `min_size_to_compress`; smaller
/// payloads are tagged `NONE`. Unpacking honours whatever tag the envelope
/// carries, so peers configured with different algorithms can still read each
/// other as long as both have the compressor registered.
#[derive(Clone)]
pub struct MessageSerializer {
    compressors: HashMap<String, Arc<dyn Compressor>>,
    compression: String,
    min_size_to_compress: usize,
}

impl fmt::Debug for MessageSerializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut registered: Vec<_> = self.compressors.keys().collect();
        registered.sort();
        f.debug_struct("MessageSerializer")
            .field("compression", &self.compression)
            .field("min_size_to_compress", &self.min_size_to_compress)
            .field("registered", &registered)
            .finish()
    }
}

impl Default for MessageSerializer {
    fn default() -> Self {
        Self::with_builtin(super::compression::LZ4, MIN_SIZE_TO_COMPRESS)
    }
}

impl MessageSerializer {
    /// Build a serializer using `compression` (case-insensitive) for payloads
    /// of at least `min_size_to_compress` bytes.
    pub fn new(compression: &str, min_size_to_compress: usize) -> Result<Self, MessageError> {
        let serializer = Self::with_builtin(compression, min_size_to_compress);
        serializer.compressor(&serializer.compression)?;
        Ok(serializer)
    }

    fn with_builtin(compression: &str, min_size_to_compress: usize) -> Self {
        let mut compressors: HashMap<String, Arc<dyn Compressor>> = HashMap::new();
        compressors.insert(NONE.to_string(), Arc::new(NoCompression));
        compressors.insert(
            super::compression::LZ4.to_string(),
            Arc::new(Lz4Compression),
        );

        Self {
            compressors,
            compression: compression.to_uppercase(),
            min_size_to_compress,
        }
    }

    /// Register an additional compressor. Replaces any compressor with the same tag.
    pub fn register(&mut self, compressor: Arc<dyn Compressor>) {
        self.compressors
            .insert(compressor.tag().to_uppercase(), compressor);
    }

    /// Switch the algorithm used for outgoing payloads.
    pub fn set_compression(&mut self, compression: &str) -> Result<(), MessageError> {
        let tag = compression.to_uppercase();
        self.compressor(&tag)?;
        self.compression = tag;
        Ok(())
    }

    pub fn compression(&self) -> &str {
        &self.compression
    }

    pub fn min_size_to_compress(&self) -> usize {
        self.min_size_to_compress
    }

    pub fn pack<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, MessageError> {
        let raw = bincode::serialize(value).map_err(|e| MessageError::Serialize(e.to_string()))?;
        self.pack_bytes(raw)
    }

    pub fn unpack<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, MessageError> {
        let raw = self.unpack_bytes(data)?;
        bincode::deserialize(&raw).map_err(|e| MessageError::Deserialize(e.to_string()))
    }

    /// Wrap already-encoded bytes in an envelope.
    pub fn pack_bytes(&self, raw: Vec<u8>) -> Result<Vec<u8>, MessageError> {
        let envelope = if self.compression != NONE && raw.len() >= self.min_size_to_compress {
            let compressor = self.compressor(&self.compression)?;
            let payload = compressor.compress(&raw)?;
            debug!(
                compression = %self.compression,
                before = raw.len(),
                after = payload.len(),
                "compressed payload"
            );
            Envelope {
                compression: self.compression.clone(),
                payload,
            }
        } else {
            Envelope {
                compression: NONE.to_string(),
                payload: raw,
            }
        };

        bincode::serialize(&envelope).map_err(|e| MessageError::Serialize(e.to_string()))
    }

    /// Open an envelope and return the decompressed inner bytes.
    pub fn unpack_bytes(&self, data: &[u8]) -> Result<Vec<u8>, MessageError> {
        let envelope: Envelope =
            bincode::deserialize(data).map_err(|e| MessageError::Deserialize(e.to_string()))?;
        let compressor = self.compressor(&envelope.compression)?;
        compressor.decompress(&envelope.payload)
    }

    fn compressor(&self, tag: &str) -> Result<&Arc<dyn Compressor>, MessageError> {
        self.compressors.get(tag).ok_or_else(|| {
            let mut supported: Vec<_> = self.compressors.keys().cloned().collect();
            supported.sort();
            MessageError::UnknownCompression {
                tag: tag.to_string(),
                supported: supported.join(","),
            }
        })
    }
}
