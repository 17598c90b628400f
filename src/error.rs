//! Error types for the netplay client core.
//!
//! Errors store numeric context directly and format lazily in `Display`, so
//! constructing one on the socket pump never allocates. The handshake
//! surfaces the first failure upward and is terminal; steady-state engine
//! code never returns these to the caller but folds them into the connection
//! flag and status string instead.

use std::fmt;
use std::io;

/// Failures reported by the protocol codec, the handshake and session init.
#[derive(Debug)]
#[non_exhaustive]
pub enum NetplayError {
    /// The peer's connection header did not start with the RetroArch netplay
    /// magic.
    BadMagic {
        /// The 32-bit value found where the magic was expected.
        found: u32,
    },
    /// The server negotiated a protocol version outside the supported range.
    UnsupportedProtocol {
        /// The version the server offered.
        version: u32,
    },
    /// The server sent a non-zero salt, meaning it demands a password.
    /// Password authentication is not supported.
    PasswordRequired,
    /// The server selected a compression mode other than "none".
    CompressionUnsupported {
        /// The compression word from the server header.
        mode: u32,
    },
    /// A handshake step received a different command than the one the
    /// sequence requires.
    WrongCommand {
        /// The command id the step expected.
        expected: u32,
        /// The command id that actually arrived.
        found: u32,
    },
    /// A payload was too small for the fields its command declares.
    MalformedPayload {
        /// The command id of the offending packet.
        cmd: u32,
        /// The declared payload size in bytes.
        size: u32,
    },
    /// The host answered our play request with a MODE packet whose PLAYING
    /// bit is clear: we were refused a player slot.
    PlayRefused,
    /// The host never confirmed our player slot within the bounded number of
    /// MODE wait attempts.
    ModeTimeout {
        /// How many packets were consumed while waiting.
        attempts: u32,
    },
    /// A receive deadline expired before the full operation completed.
    Timeout,
    /// The peer closed the connection (end of stream mid-operation).
    ConnectionClosed,
    /// The emulator core reported a zero-byte snapshot size; the state ring
    /// cannot be allocated.
    ZeroStateSize,
    /// Wire struct encoding or decoding failed.
    Codec(crate::protocol::codec::CodecError),
    /// An underlying socket operation failed.
    Io(io::Error),
}

impl fmt::Display for NetplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic { found } => {
                write!(f, "bad netplay magic 0x{found:08x}")
            },
            Self::UnsupportedProtocol { version } => {
                write!(f, "unsupported netplay protocol version {version}")
            },
            Self::PasswordRequired => {
                write!(f, "server requires a password (not supported)")
            },
            Self::CompressionUnsupported { mode } => {
                write!(f, "server selected unsupported compression mode {mode}")
            },
            Self::WrongCommand { expected, found } => {
                write!(
                    f,
                    "expected command 0x{expected:04x}, got 0x{found:04x}"
                )
            },
            Self::MalformedPayload { cmd, size } => {
                write!(
                    f,
                    "malformed payload for command 0x{cmd:04x} ({size} bytes)"
                )
            },
            Self::PlayRefused => write!(f, "play request refused by server"),
            Self::ModeTimeout { attempts } => {
                write!(f, "no MODE confirmation after {attempts} packets")
            },
            Self::Timeout => write!(f, "network operation timed out"),
            Self::ConnectionClosed => write!(f, "connection closed by peer"),
            Self::ZeroStateSize => {
                write!(f, "core reported a zero serialize size")
            },
            Self::Codec(err) => write!(f, "wire codec error: {err}"),
            Self::Io(err) => write!(f, "socket error: {err}"),
        }
    }
}

impl std::error::Error for NetplayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Codec(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for NetplayError {
    /// Maps socket errors onto the transport taxonomy: timed-out reads
    /// become [`NetplayError::Timeout`], an unexpected end of stream becomes
    /// [`NetplayError::ConnectionClosed`], everything else is carried as-is.
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::Timeout,
            io::ErrorKind::UnexpectedEof => Self::ConnectionClosed,
            _ => Self::Io(err),
        }
    }
}

impl From<crate::protocol::codec::CodecError> for NetplayError {
    fn from(err: crate::protocol::codec::CodecError) -> Self {
        Self::Codec(err)
    }
}
