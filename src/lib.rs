//! # ra-rollback
//!
//! A rollback netplay client core that lets a deterministic emulator join a
//! RetroArch netplay host as a peer. Two instances run the same game core in
//! lockstep: each tick both peers submit a controller sample, exchange the
//! samples over TCP, and advance one frame. Because the round trip exceeds a
//! frame, the client predicts the remote input, advances immediately, and
//! rewinds/re-executes when the real input arrives. State checksums detect
//! divergence; the host recovers the client with a pushed savestate.
//!
//! The crate is two subsystems:
//!
//! - [`protocol`] frames the RetroArch netplay wire protocol: the 24-byte
//!   connection headers, the 8-byte command envelope, the CMD_* payloads, the
//!   client handshake and LAN discovery. Every integer on the wire is
//!   big-endian; the layouts are fixed by the peer and must match exactly.
//! - [`rollback`] owns the 128-slot frame ring and the parallel state ring.
//!   On every emulator tick [`RollbackSession::update`] records the local
//!   input, predicts the remote one, snapshots the core, pumps the socket,
//!   and rolls back and replays when a prediction turns out wrong.
//!
//! ## Per-frame control flow
//!
//! ```text
//! emulator tick
//!   ├─ session.update(local_input)      save state, send CMD_INPUT,
//!   │                                   drain socket, rollback if needed,
//!   │                                   send CMD_CRC
//!   ├─ core.run_frame(&lanes)           the real frame; the core polls
//!   │                                   lanes.input(port) for both pads
//!   └─ session.post_frame()             advance the frame counter
//! ```
//!
//! The session never stalls the emulator: `update` returns within a bounded
//! time regardless of network activity. This is speculative-execution
//! netplay, not lockstep.
//!
//! ## Joining a host
//!
//! ```no_run
//! use std::net::TcpStream;
//! use ra_rollback::{client_handshake, HandshakeContext, RollbackSession};
//! # use ra_rollback::EmulatorCore;
//! # struct MyCore;
//! # impl ra_rollback::EmulatorCore for MyCore {
//! #     fn serialize_size(&mut self) -> usize { 1 }
//! #     fn serialize(&mut self, _: &mut [u8]) -> bool { true }
//! #     fn unserialize(&mut self, _: &[u8]) -> bool { true }
//! #     fn run_frame(&mut self, _: &ra_rollback::InputLanes) {}
//! # }
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let stream = TcpStream::connect("192.168.1.20:55435")?;
//! let ctx = HandshakeContext {
//!     nick: "handheld".into(),
//!     content_crc: 0x1234_5678,
//!     core_name: "snes9x".into(),
//!     core_version: "1.62".into(),
//! };
//! let outcome = client_handshake(&stream, &ctx)?;
//!
//! let mut core = MyCore;
//! let mut session =
//!     RollbackSession::new(stream, &mut core, outcome.client_num, outcome.start_frame)
//!         .map_err(|e| e.reason)?;
//! let lanes = session.lanes();
//! while session.is_connected() {
//!     let pad = 0u16; // sample the local joypad
//!     session.update(&mut core, pad);
//!     core.run_frame(&lanes);
//!     session.post_frame();
//! }
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod checksum;
pub mod error;
pub mod protocol;
pub mod rollback;

pub use error::NetplayError;
pub use protocol::discovery::DiscoveredHost;
pub use protocol::handshake::{client_handshake, HandshakeContext, HandshakeOutcome};
pub use rollback::{InitError, InputLanes, RollbackSession};

/// A frame is a single tick of the emulated core: one unit of both simulation
/// time and input sampling.
///
/// Frame numbers are the unsigned 32-bit values the wire protocol carries.
/// The newtype keeps them from mixing with ring indices and byte counts; ring
/// positions are derived with a power-of-two mask inside the engine.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Frame(u32);

impl Frame {
    /// Creates a `Frame` from a raw wire value.
    #[inline]
    #[must_use]
    pub const fn new(frame: u32) -> Self {
        Frame(frame)
    }

    /// Returns the raw frame number.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::ops::Add<u32> for Frame {
    type Output = Frame;

    #[inline]
    fn add(self, rhs: u32) -> Frame {
        Frame(self.0 + rhs)
    }
}

impl std::ops::AddAssign<u32> for Frame {
    #[inline]
    fn add_assign(&mut self, rhs: u32) {
        self.0 += rhs;
    }
}

impl std::ops::Sub<u32> for Frame {
    type Output = Frame;

    #[inline]
    fn sub(self, rhs: u32) -> Frame {
        Frame(self.0 - rhs)
    }
}

/// Distance in frames. The left operand must not precede the right one.
impl std::ops::Sub<Frame> for Frame {
    type Output = u32;

    #[inline]
    fn sub(self, rhs: Frame) -> u32 {
        self.0 - rhs.0
    }
}

impl From<u32> for Frame {
    #[inline]
    fn from(value: u32) -> Self {
        Frame(value)
    }
}

impl From<Frame> for u32 {
    #[inline]
    fn from(frame: Frame) -> Self {
        frame.0
    }
}

/// The contract between the engine and the emulator core.
///
/// The core is a black box with a serializable state and a single-frame step
/// function. The session borrows it for the duration of each call; ownership
/// stays with the caller, which runs the real (non-replay) frames itself.
///
/// Determinism is required: given the same state and the same inputs, every
/// peer must produce bit-identical serialized state, or checksum comparison
/// will flag a desync.
pub trait EmulatorCore {
    /// Number of bytes of one state snapshot. Queried once at session init;
    /// the engine assumes the size stays stable for the session's lifetime.
    fn serialize_size(&mut self) -> usize;

    /// Writes the full core state into `buf` (exactly `serialize_size()`
    /// bytes). Returns `false` if the snapshot could not be produced.
    fn serialize(&mut self, buf: &mut [u8]) -> bool;

    /// Restores core state from a snapshot. Returns `false` on failure.
    fn unserialize(&mut self, buf: &[u8]) -> bool;

    /// Advances the simulation by one frame. During the call the core polls
    /// `inputs.input(port)` for both joypads and must suppress audio and
    /// video output while `inputs.is_replaying()` returns `true`.
    fn run_frame(&mut self, inputs: &InputLanes);
}
