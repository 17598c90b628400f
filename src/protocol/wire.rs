//! Wire struct layouts.
//!
//! Each struct here mirrors, field for field, a packed structure the peer
//! reads or writes. Encoded through [`super::codec`] they produce the exact
//! on-wire byte sequences; none of them may gain, lose or reorder fields.
//!
//! String fields are fixed-width, zero-padded byte arrays. A missing
//! terminator inside the field is permitted on receive.

use serde::{Deserialize, Serialize};

use super::{
    IMPL_MAGIC, PLATFORM_MAGIC, PROTOCOL_VERSION_MAX, PROTOCOL_VERSION_MIN, RA_MAGIC,
};

/// Length of the command envelope prepended to every command.
pub const PACKET_HEADER_LEN: usize = 8;

/// Length of the connection header exchanged once in each direction.
pub const CONNECTION_HEADER_LEN: usize = 24;

/// Length of a CMD_INPUT payload carrying a single joypad word.
pub const INPUT_PAYLOAD_LEN: usize = 12;

/// The command envelope: command id plus declared payload size in bytes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketHeader {
    /// Command id (one of [`super::cmd`]).
    pub cmd: u32,
    /// Payload size in bytes, excluding this header.
    pub size: u32,
}

/// Connection header the client sends immediately after TCP establishment.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientHello {
    /// Always [`RA_MAGIC`].
    pub magic: u32,
    /// Identifies the client platform; informational for the peer.
    pub platform_magic: u32,
    /// Requested compression; zero requests none.
    pub compression: u32,
    /// Highest protocol version the client supports.
    pub proto_max: u32,
    /// Lowest protocol version the client supports.
    pub proto_min: u32,
    /// Identifies this implementation; informational for the peer.
    pub impl_magic: u32,
}

impl ClientHello {
    /// The hello this client sends: no compression, protocol version range
    /// pinned to the single supported version.
    #[must_use]
    pub fn new() -> Self {
        Self {
            magic: RA_MAGIC,
            platform_magic: PLATFORM_MAGIC,
            compression: 0,
            proto_max: PROTOCOL_VERSION_MAX,
            proto_min: PROTOCOL_VERSION_MIN,
            impl_magic: IMPL_MAGIC,
        }
    }
}

impl Default for ClientHello {
    fn default() -> Self {
        Self::new()
    }
}

/// Connection header the server replies with. Same 24 bytes as
/// [`ClientHello`] with two fields reinterpreted.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHello {
    /// Must be [`RA_MAGIC`].
    pub magic: u32,
    /// The server's platform identifier.
    pub platform_magic: u32,
    /// Compression the server selected; anything but zero is unsupported.
    pub compression: u32,
    /// Password salt; non-zero means the server demands a password.
    pub salt: u32,
    /// The protocol version the server negotiated.
    pub proto: u32,
    /// The server's implementation identifier.
    pub impl_magic: u32,
}

/// CMD_INFO payload: identifies the loaded content and core.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoPayload {
    /// CRC32 of the loaded content.
    pub content_crc: u32,
    /// Core library name, zero-padded.
    pub core_name: [u8; 32],
    /// Core library version, zero-padded.
    pub core_version: [u8; 32],
}

/// CMD_INPUT payload prefix (protocol v6).
///
/// The payload is exactly `(2 + N) * 4` bytes where `N` is the number of
/// input words; the peer derives `N` from the payload length. A digital
/// joypad is one word, so this client always sends exactly three words.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputPayload {
    /// The frame this input is for.
    pub frame: u32,
    /// `(is_server << 31) | (client & 0x7FFF_FFFF)`.
    pub player_word: u32,
    /// Joypad bitmask, zero-extended to 32 bits.
    pub joypad_word: u32,
}

/// CMD_CRC payload: a frame number and the state CRC32 for that frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrcPayload {
    /// The frame the checksum was computed at.
    pub frame: u32,
    /// CRC32 of the serialized state at the start of that frame.
    pub crc: u32,
}

/// First three words of the variable-length CMD_SYNC payload. The per-client
/// share modes and device maps that follow are consumed and ignored.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPrefix {
    /// The server's frame counter when we joined.
    pub frame: u32,
    /// Bitmask of connected clients; informational.
    pub connections: u32,
    /// The client number the server assigned to us.
    pub client_num: u32,
}

/// First two words of a CMD_LOAD_SAVESTATE payload; the serialized state
/// follows.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavestatePrefix {
    /// The frame the snapshot was taken at.
    pub frame: u32,
    /// Size of the serialized state that follows, in bytes.
    pub size: u32,
}

/// First two words of a CMD_MODE payload.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModePrefix {
    /// The frame the mode change takes effect at.
    pub frame: u32,
    /// Bit 31 = addressed to us, bit 30 = playing, bits 0-15 = client number.
    pub flags: u32,
}

/// Copies `s` into a zero-padded fixed-width field, truncating so the final
/// byte always stays a terminator.
#[must_use]
pub fn pad_fixed<const N: usize>(s: &str) -> [u8; N] {
    let mut field = [0u8; N];
    let bytes = s.as_bytes();
    let len = bytes.len().min(N - 1);
    field[..len].copy_from_slice(&bytes[..len]);
    field
}

/// Reads a fixed-width field back into a string: everything up to the first
/// zero byte, or the whole field if no terminator is present.
#[must_use]
pub fn fixed_to_string(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}
