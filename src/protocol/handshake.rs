//! The client-side connection sequence.
//!
//! After TCP establishment the client must walk the host's fixed sequence
//! before it may submit inputs:
//!
//! 1. Send the 24-byte client connection header.
//! 2. Receive and validate the server connection header.
//! 3. Send CMD_NICK; receive the server's CMD_NICK.
//! 4. Receive the server's CMD_INFO (diagnostic only), send our CMD_INFO.
//! 5. Receive CMD_SYNC: server frame counter and our client number.
//! 6. Send CMD_PLAY to request a player slot; without it the server treats
//!    us as a spectator and rejects our inputs.
//! 7. Consume packets until a CMD_MODE addressed to us confirms (or
//!    refuses) the slot.
//!
//! Every step bounds its wait with a deadline. Any failure is terminal; the
//! caller owns the stream and decides whether to retry from scratch.

use std::net::TcpStream;
use std::time::Duration;

use tracing::debug;

use super::{cmd, codec, wire, NICK_LEN, PROTOCOL_VERSION_MAX, PROTOCOL_VERSION_MIN, RA_MAGIC};
use crate::error::NetplayError;
use crate::Frame;

/// Per-step receive deadline.
const STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// How many packets to consume while waiting for our CMD_MODE. Tuned to the
/// peer's behavior: the host may interleave INPUT and CRC traffic for other
/// clients before the MODE broadcast arrives.
const MODE_WAIT_ATTEMPTS: u32 = 50;

/// MODE flag bit: this packet is addressed to us.
const MODE_FLAG_YOU: u32 = 1 << 31;

/// MODE flag bit: the addressed client is playing (not spectating).
const MODE_FLAG_PLAYING: u32 = 1 << 30;

/// What this client tells the host about itself.
#[derive(Debug, Clone)]
pub struct HandshakeContext {
    /// Nickname, truncated to the 32-byte wire field.
    pub nick: String,
    /// CRC32 of the loaded content.
    pub content_crc: u32,
    /// Core library name.
    pub core_name: String,
    /// Core library version.
    pub core_version: String,
}

/// What the host told us during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeOutcome {
    /// The protocol version the server negotiated.
    pub negotiated_proto: u32,
    /// The client number the server assigned to us.
    pub client_num: u32,
    /// The frame our input stream starts at: CMD_SYNC's frame counter,
    /// raised to CMD_MODE's frame if the server scheduled us later.
    pub start_frame: Frame,
    /// The server's nickname.
    pub server_nick: String,
}

/// Runs the client handshake on a freshly connected stream.
pub fn client_handshake(
    stream: &TcpStream,
    ctx: &HandshakeContext,
) -> Result<HandshakeOutcome, NetplayError> {
    // Step 1: client connection header.
    super::send_all(stream, &codec::encode(&wire::ClientHello::new())?)?;

    // Step 2: server connection header.
    let mut raw = [0u8; wire::CONNECTION_HEADER_LEN];
    super::recv_exact(
        stream,
        &mut raw,
        std::time::Instant::now() + STEP_TIMEOUT,
    )?;
    let hello: wire::ServerHello = codec::decode_value(&raw)?;

    if hello.magic != RA_MAGIC {
        return Err(NetplayError::BadMagic { found: hello.magic });
    }
    debug!(
        proto = hello.proto,
        compression = hello.compression,
        "received server header"
    );
    if hello.proto < PROTOCOL_VERSION_MIN || hello.proto > PROTOCOL_VERSION_MAX {
        return Err(NetplayError::UnsupportedProtocol {
            version: hello.proto,
        });
    }
    if hello.salt != 0 {
        return Err(NetplayError::PasswordRequired);
    }
    if hello.compression != 0 {
        return Err(NetplayError::CompressionUnsupported {
            mode: hello.compression,
        });
    }

    // Step 3: nickname exchange.
    let nick_field: [u8; NICK_LEN] = wire::pad_fixed(&ctx.nick);
    super::send_command(stream, cmd::NICK, &nick_field)?;

    let mut nick_buf = [0u8; NICK_LEN];
    let (header, copied) = super::recv_command(stream, &mut nick_buf, STEP_TIMEOUT)?;
    if header.cmd != cmd::NICK {
        return Err(NetplayError::WrongCommand {
            expected: cmd::NICK,
            found: header.cmd,
        });
    }
    let server_nick = wire::fixed_to_string(&nick_buf[..copied]);
    debug!(server_nick = %server_nick, "nickname exchange complete");

    // Step 4: the server announces its content first; the payload is only
    // diagnostic for us since the host already decides what runs.
    let mut info_buf = [0u8; 256];
    let (header, _) = super::recv_command(stream, &mut info_buf, STEP_TIMEOUT)?;
    if header.cmd != cmd::INFO {
        return Err(NetplayError::WrongCommand {
            expected: cmd::INFO,
            found: header.cmd,
        });
    }
    debug!(size = header.size, "received server INFO");

    let info = wire::InfoPayload {
        content_crc: ctx.content_crc,
        core_name: wire::pad_fixed(&ctx.core_name),
        core_version: wire::pad_fixed(&ctx.core_version),
    };
    super::send_command(stream, cmd::INFO, &codec::encode(&info)?)?;

    // Step 5: CMD_SYNC. Variable length; only the three leading words
    // matter to us, the device tables beyond them are ignored.
    let mut sync_buf = [0u8; 4096];
    let (header, copied) = super::recv_command(stream, &mut sync_buf, STEP_TIMEOUT)?;
    if header.cmd != cmd::SYNC {
        return Err(NetplayError::WrongCommand {
            expected: cmd::SYNC,
            found: header.cmd,
        });
    }
    if copied < 12 {
        return Err(NetplayError::MalformedPayload {
            cmd: cmd::SYNC,
            size: header.size,
        });
    }
    let (sync, _): (wire::SyncPrefix, usize) = codec::decode_prefix(&sync_buf[..copied])?;
    let mut start_frame = Frame::new(sync.frame);
    let client_num = sync.client_num;
    debug!(
        start_frame = sync.frame,
        connections = sync.connections,
        client_num,
        "received SYNC"
    );

    // Step 6: request a player slot. A single zero word: auto-assign a
    // device, not a slave, no share mode preference.
    super::send_command(stream, cmd::PLAY, &codec::encode(&0u32)?)?;

    // Step 7: wait for the MODE packet that carries our assignment. MODE
    // broadcasts for other clients and unrelated traffic are consumed and
    // dropped; the bounded attempt count keeps a silent host from hanging us.
    for _ in 0..MODE_WAIT_ATTEMPTS {
        let mut mode_buf = [0u8; 64];
        let (header, copied) = super::recv_command(stream, &mut mode_buf, STEP_TIMEOUT)?;
        if header.cmd != cmd::MODE || copied < 8 {
            continue;
        }
        let (mode, _): (wire::ModePrefix, usize) = codec::decode_prefix(&mode_buf[..copied])?;
        if mode.flags & MODE_FLAG_YOU == 0 {
            continue;
        }
        if mode.flags & MODE_FLAG_PLAYING == 0 {
            return Err(NetplayError::PlayRefused);
        }

        let assigned = mode.flags & 0xFFFF;
        // The server may schedule our first input frame later than SYNC
        // reported; never earlier.
        if Frame::new(mode.frame) > start_frame {
            start_frame = Frame::new(mode.frame);
        }
        debug!(
            assigned,
            mode_frame = mode.frame,
            "MODE confirmed: playing"
        );
        return Ok(HandshakeOutcome {
            negotiated_proto: hello.proto,
            client_num,
            start_frame,
            server_nick,
        });
    }

    Err(NetplayError::ModeTimeout {
        attempts: MODE_WAIT_ATTEMPTS,
    })
}
