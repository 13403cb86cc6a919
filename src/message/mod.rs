//! Message envelopes: everything written to the coordination store goes
//! through a [`MessageSerializer`].

mod compression;
mod errors;
mod serializer;

pub use compression::{Compressor, LZ4, Lz4Compression, NONE, NoCompression};
pub use errors::MessageError;
pub use serializer::{Envelope, MIN_SIZE_TO_COMPRESS, MessageSerializer};
