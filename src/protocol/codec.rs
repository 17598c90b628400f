//! Central wire codec configuration.
//!
//! Every integer the RetroArch netplay protocol puts on the wire is
//! big-endian, and every struct is a plain sequence of fixed-size fields.
//! One bincode configuration (fixed-int, big-endian) therefore maps the
//! serde wire structs in [`super::wire`] directly onto the peer's packed C
//! layouts, keeping all byte-order handling in a single place instead of
//! scattering manual swaps through the codebase.
//!
//! Decoding always happens on a slice whose length the caller has already
//! checked against the declared payload size; a decode failure here means a
//! malformed packet, not a short read.

use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

// Fixed-size integers keep the encoded layout identical to the peer's packed
// structs; big-endian is the protocol's network byte order.
fn config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_fixed_int_encoding()
        .with_big_endian()
}

/// Errors from encoding or decoding a wire struct.
#[derive(Debug)]
pub enum CodecError {
    /// Encoding failed. Practically unreachable for the fixed-layout wire
    /// structs; surfaced rather than swallowed.
    Encode(String),
    /// The bytes did not decode as the expected wire struct.
    Decode(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode(msg) => write!(f, "encode failed: {msg}"),
            Self::Decode(msg) => write!(f, "decode failed: {msg}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Encodes a wire struct into a new byte vector.
pub fn encode<T: Serialize>(value: &T) -> CodecResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, config())
        .map_err(|e| CodecError::Encode(e.to_string()))
}

/// Encodes a wire struct into an existing buffer, returning the number of
/// bytes written.
pub fn encode_into<T: Serialize>(value: &T, buffer: &mut [u8]) -> CodecResult<usize> {
    bincode::serde::encode_into_slice(value, buffer, config())
        .map_err(|e| CodecError::Encode(e.to_string()))
}

/// Decodes a wire struct from the front of `bytes`, returning the value and
/// the number of bytes consumed. Trailing bytes are left untouched; several
/// RA payloads carry fields past the prefix we parse.
pub fn decode_prefix<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<(T, usize)> {
    bincode::serde::decode_from_slice(bytes, config())
        .map_err(|e| CodecError::Decode(e.to_string()))
}

/// Decodes a wire struct from `bytes`, ignoring how many bytes were read.
pub fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    decode_prefix(bytes).map(|(value, _)| value)
}
