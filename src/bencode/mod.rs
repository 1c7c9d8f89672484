//! Bencode module
//!
//! Encoding and strict decoding of the bencode serialization format used by
//! torrent metadata and HTTP tracker responses.

pub mod decode;
pub mod encode;
pub mod value;

// Re-export main types
pub use decode::{decode, decode_prefix, MAX_DEPTH};
pub use encode::{encode, encode_into};
pub use value::Value;
