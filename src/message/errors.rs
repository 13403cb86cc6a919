use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("received message with unknown compression type '{tag}', supported types are {supported}")]
    UnknownCompression { tag: String, supported: String },

    #[error("compression failed ({tag}): {reason}")]
    Compress { tag: String, reason: String },

    #[error("decompression failed ({tag}): {reason}")]
    Decompress { tag: String, reason: String },

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),
}
