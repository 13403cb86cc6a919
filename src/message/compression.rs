use std::io::{Read, Write};

use lz4_flex::frame::{FrameDecoder, FrameEncoder};

use super::errors::MessageError;

pub const NONE: &str = "NONE";
pub const LZ4: &str = "LZ4";

/// A payload compressor registered with a `MessageSerializer` under its tag.
///
/// The tag travels inside every envelope, so both ends must have the same
/// compressor registered for the tag to be decodable.
pub trait Compressor: Send + Sync {
    fn tag(&self) -> &'static str;
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, MessageError>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, MessageError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoCompression;

impl Compressor for NoCompression {
    fn tag(&self) -> &'static str {
        NONE
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, MessageError> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, MessageError> {
        Ok(data.to_vec())
    }
}

/// LZ4 frame format.
#[derive(Debug, Default, Clone, Copy)]
pub struct Lz4Compression;

impl Compressor for Lz4Compression {
    fn tag(&self) -> &'static str {
        LZ4
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, MessageError> {
        let fail = |e: std::io::Error| MessageError::Compress {
            tag: LZ4.to_string(),
            reason: e.to_string(),
        };

        let mut encoder = FrameEncoder::new(Vec::with_capacity(data.len() / 2));
        encoder.write_all(data).map_err(fail)?;
        encoder.finish().map_err(|e| MessageError::Compress {
            tag: LZ4.to_string(),
            reason: e.to_string(),
        })
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, MessageError> {
        let mut out = Vec::with_capacity(data.len() * 2);
        FrameDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| MessageError::Decompress {
                tag: LZ4.to_string(),
                reason: e.to_string(),
            })?;
        Ok(out)
    }
}
