//! The RetroArch netplay wire protocol.
//!
//! Framing is simple: after a one-time exchange of 24-byte connection
//! headers, every message is an 8-byte envelope `{cmd, size}` followed by
//! `size` payload bytes, all integers big-endian. The command ids and
//! payload layouts are fixed by the peer and must not be renumbered.
//!
//! This module provides the framing primitives ([`send_command`],
//! [`recv_command`], [`drain_bytes`]) and the per-frame input/checksum
//! codecs ([`send_input`], [`parse_input`], [`send_crc`]). The connection
//! sequence lives in [`handshake`], host enumeration in [`discovery`], the
//! struct layouts in [`wire`] and the byte-order plumbing in [`codec`].
//!
//! Receive operations take a deadline covering the whole operation, not each
//! syscall. Reads past the caller's buffer are drained so the stream always
//! stays framed on command boundaries.

pub mod codec;
pub mod discovery;
pub mod handshake;
pub mod wire;

use std::io::{self, Read};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use crate::error::NetplayError;
use crate::Frame;

/// The RetroArch netplay protocol magic ("RANP").
pub const RA_MAGIC: u32 = 0x5241_4E50;

/// Platform identifier this client advertises ("HHEM"). Informational; the
/// peer logs it but does not validate it.
pub const PLATFORM_MAGIC: u32 = 0x4848_454D;

/// Implementation identifier this client advertises ("RBCL").
pub const IMPL_MAGIC: u32 = 0x5242_434C;

/// Lowest netplay protocol version this client speaks.
pub const PROTOCOL_VERSION_MIN: u32 = 6;

/// Highest netplay protocol version this client speaks.
pub const PROTOCOL_VERSION_MAX: u32 = 6;

/// Width of the fixed nickname field.
pub const NICK_LEN: usize = 32;

/// Width of the fixed core-name field.
pub const CORE_NAME_LEN: usize = 32;

/// Width of the fixed core-version field.
pub const CORE_VERSION_LEN: usize = 32;

/// Width of the short string fields in a discovery ad packet.
pub const HOST_STR_LEN: usize = 32;

/// Width of the long string fields in a discovery ad packet.
pub const HOST_LONGSTR_LEN: usize = 256;

/// Deadline applied to [`drain_bytes`]; bounds how long a discard of a
/// mis-sized payload may stall.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Netplay command identifiers. Values are fixed by the peer.
pub mod cmd {
    /// Generic acknowledgement.
    pub const ACK: u32 = 0x0000;
    /// Generic refusal.
    pub const NAK: u32 = 0x0001;
    /// Peer is leaving the session.
    pub const DISCONNECT: u32 = 0x0002;
    /// Per-frame controller input.
    pub const INPUT: u32 = 0x0003;
    /// Sender has no input for a frame.
    pub const NOINPUT: u32 = 0x0004;
    /// Nickname exchange during the handshake.
    pub const NICK: u32 = 0x0020;
    /// Password response (never sent by this client).
    pub const PASSWORD: u32 = 0x0021;
    /// Content CRC plus core name and version.
    pub const INFO: u32 = 0x0022;
    /// Server state snapshot: frame counter, connection bitmask, client
    /// number, device config.
    pub const SYNC: u32 = 0x0023;
    /// Request to spectate.
    pub const SPECTATE: u32 = 0x0024;
    /// Request a player slot.
    pub const PLAY: u32 = 0x0025;
    /// Player slot assignment broadcast.
    pub const MODE: u32 = 0x0026;
    /// Per-frame state checksum.
    pub const CRC: u32 = 0x0040;
    /// Ask the server to push a savestate.
    pub const REQUEST_SAVESTATE: u32 = 0x0041;
    /// Server-pushed savestate for resynchronization.
    pub const LOAD_SAVESTATE: u32 = 0x0042;
    /// Sender paused.
    pub const PAUSE: u32 = 0x0043;
    /// Sender resumed.
    pub const RESUME: u32 = 0x0044;
    /// Configuration change broadcast.
    pub const CFG: u32 = 0x0061;
    /// Configuration change acknowledgement.
    pub const CFG_ACK: u32 = 0x0062;
}

/// A parsed CMD_INPUT payload.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct InputReport {
    /// The frame the input applies to.
    pub frame: Frame,
    /// The reporting player, with the server bit stripped.
    pub player: u32,
    /// The 16-bit digital joypad bitmask.
    pub joypad: u16,
}

// ---------------------------------------------------------------------------
// Byte-level socket helpers
// ---------------------------------------------------------------------------

/// Sends the whole buffer, looping over partial writes. On unix the write
/// goes through `MSG_NOSIGNAL` so a broken peer surfaces as an error instead
/// of a SIGPIPE in the host process.
#[cfg(unix)]
pub(crate) fn send_all(stream: &TcpStream, buf: &[u8]) -> Result<(), NetplayError> {
    use std::os::unix::io::AsRawFd;

    let fd = stream.as_raw_fd();
    let mut sent = 0;
    while sent < buf.len() {
        let remaining = &buf[sent..];
        // SAFETY: `fd` is a live socket borrowed from `stream`, and the
        // pointer/length pair describes the `remaining` slice, which outlives
        // the call.
        let n = unsafe {
            libc::send(
                fd,
                remaining.as_ptr().cast::<libc::c_void>(),
                remaining.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => continue,
                _ => return Err(NetplayError::Io(err)),
            }
        }
        sent += n as usize;
    }
    Ok(())
}

/// Sends the whole buffer, looping over partial writes.
#[cfg(not(unix))]
pub(crate) fn send_all(stream: &TcpStream, buf: &[u8]) -> Result<(), NetplayError> {
    use std::io::Write;

    let mut writer = stream;
    writer.write_all(buf)?;
    Ok(())
}

/// Receives exactly `buf.len()` bytes. The deadline bounds the whole
/// operation; hitting it mid-read fails with [`NetplayError::Timeout`], and
/// a peer close mid-read fails with [`NetplayError::ConnectionClosed`].
pub(crate) fn recv_exact(
    stream: &TcpStream,
    buf: &mut [u8],
    deadline: Instant,
) -> Result<(), NetplayError> {
    let mut reader = stream;
    let mut filled = 0;
    while filled < buf.len() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(NetplayError::Timeout);
        }
        stream.set_read_timeout(Some(remaining))?;
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Err(NetplayError::ConnectionClosed),
            Ok(n) => filled += n,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock
                        | io::ErrorKind::TimedOut
                        | io::ErrorKind::Interrupted
                ) =>
            {
                continue;
            },
            Err(e) => return Err(NetplayError::Io(e)),
        }
    }
    Ok(())
}

/// Reports whether the stream has at least one readable byte (or a pending
/// close) without consuming anything. Zero-timeout readiness check: never
/// blocks.
pub(crate) fn has_pending(stream: &TcpStream) -> Result<bool, NetplayError> {
    stream.set_nonblocking(true).map_err(NetplayError::Io)?;
    let mut probe = [0u8; 1];
    let result = stream.peek(&mut probe);
    let restore = stream.set_nonblocking(false);
    let pending = match result {
        // A zero-byte peek means the peer closed; report it as pending so
        // the next read surfaces the close to the caller.
        Ok(_) => true,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
        Err(e) => return Err(NetplayError::Io(e)),
    };
    restore.map_err(NetplayError::Io)?;
    Ok(pending)
}

/// Consumes and discards exactly `remaining` payload bytes under `deadline`.
pub(crate) fn drain_deadline(
    stream: &TcpStream,
    mut remaining: u32,
    deadline: Instant,
) -> Result<(), NetplayError> {
    let mut scratch = [0u8; 256];
    while remaining > 0 {
        let chunk = remaining.min(scratch.len() as u32) as usize;
        recv_exact(stream, &mut scratch[..chunk], deadline)?;
        remaining -= chunk as u32;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Command framing
// ---------------------------------------------------------------------------

/// Sends one framed command: 8-byte envelope, then the payload.
pub fn send_command(stream: &TcpStream, cmd: u32, payload: &[u8]) -> Result<(), NetplayError> {
    let header = wire::PacketHeader {
        cmd,
        size: payload.len() as u32,
    };
    let mut packet = Vec::with_capacity(wire::PACKET_HEADER_LEN + payload.len());
    packet.extend_from_slice(&codec::encode(&header)?);
    packet.extend_from_slice(payload);
    send_all(stream, &packet)
}

/// Receives one framed command. The payload is copied into `buf` up to its
/// capacity; any declared bytes beyond that are drained so the stream stays
/// framed. Returns the envelope and the number of bytes copied.
///
/// The timeout covers the entire operation: envelope, payload and drain.
pub fn recv_command(
    stream: &TcpStream,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<(wire::PacketHeader, usize), NetplayError> {
    let deadline = Instant::now() + timeout;
    let header = read_header(stream, deadline)?;
    let copied = recv_payload(stream, buf, header.size, deadline)?;
    Ok((header, copied))
}

/// Consumes and discards exactly `n` payload bytes.
pub fn drain_bytes(stream: &TcpStream, n: u32) -> Result<(), NetplayError> {
    drain_deadline(stream, n, Instant::now() + DRAIN_TIMEOUT)
}

/// Reads and decodes one 8-byte command envelope.
pub(crate) fn read_header(
    stream: &TcpStream,
    deadline: Instant,
) -> Result<wire::PacketHeader, NetplayError> {
    let mut raw = [0u8; wire::PACKET_HEADER_LEN];
    recv_exact(stream, &mut raw, deadline)?;
    Ok(codec::decode_value(&raw)?)
}

/// Reads a payload of `declared` bytes: up to `buf.len()` bytes are copied,
/// the rest is drained. Returns the number of bytes copied.
pub(crate) fn recv_payload(
    stream: &TcpStream,
    buf: &mut [u8],
    declared: u32,
    deadline: Instant,
) -> Result<usize, NetplayError> {
    let declared = declared as usize;
    let copied = declared.min(buf.len());
    recv_exact(stream, &mut buf[..copied], deadline)?;
    if declared > copied {
        drain_deadline(stream, (declared - copied) as u32, deadline)?;
    }
    Ok(copied)
}

// ---------------------------------------------------------------------------
// Per-frame payloads
// ---------------------------------------------------------------------------

/// Sends CMD_INPUT for one frame.
///
/// The payload is exactly three words: frame, `(is_server << 31) | client`,
/// and the joypad bitmask zero-extended to 32 bits. The peer derives the
/// device count from the payload length, so no analog words may be appended
/// for a digital pad.
pub fn send_input(
    stream: &TcpStream,
    frame: Frame,
    client_num: u32,
    joypad: u16,
) -> Result<(), NetplayError> {
    let payload = wire::InputPayload {
        frame: frame.as_u32(),
        // is_server stays clear; we are always the client side.
        player_word: client_num & 0x7FFF_FFFF,
        joypad_word: u32::from(joypad),
    };
    send_command(stream, cmd::INPUT, &codec::encode(&payload)?)
}

/// Parses a CMD_INPUT payload. Requires at least the three mandatory words;
/// any trailing analog words are ignored.
pub fn parse_input(payload: &[u8]) -> Result<InputReport, NetplayError> {
    if payload.len() < wire::INPUT_PAYLOAD_LEN {
        return Err(NetplayError::MalformedPayload {
            cmd: cmd::INPUT,
            size: payload.len() as u32,
        });
    }
    let raw: wire::InputPayload = codec::decode_value(&payload[..wire::INPUT_PAYLOAD_LEN])?;
    Ok(InputReport {
        frame: Frame::new(raw.frame),
        player: raw.player_word & 0x7FFF_FFFF,
        joypad: raw.joypad_word as u16,
    })
}

/// Sends CMD_CRC: the frame number and the state checksum for it.
pub fn send_crc(stream: &TcpStream, frame: Frame, crc: u32) -> Result<(), NetplayError> {
    let payload = wire::CrcPayload {
        frame: frame.as_u32(),
        crc,
    };
    send_command(stream, cmd::CRC, &codec::encode(&payload)?)
}
