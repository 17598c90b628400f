//! The rollback engine.
//!
//! Speculative execution with rewind/replay: every tick the engine records
//! the local input, predicts the host's, snapshots the core and lets the
//! emulator run the frame immediately. When the host's real input arrives
//! and disagrees with a prediction, the engine restores the snapshot from
//! the mispredicted frame and re-runs the core, audio and video suppressed,
//! up to the present. Periodic CRC exchange catches silent divergence; a
//! server-pushed savestate repairs it.
//!
//! ## Tick anatomy
//!
//! [`RollbackSession::update`] runs under the engine mutex:
//!
//! 1. Fill the current frame's slot: local input, and a predicted remote
//!    input unless the host's value already arrived. The prediction is the
//!    most recent confirmed remote input, or zero before any exists.
//! 2. Serialize the core into the state ring, so this frame can be rewound
//!    to later.
//! 3. Send CMD_INPUT for the current frame.
//! 4. Drain every pending command without blocking, remembering the oldest
//!    frame whose confirmed input contradicts the prediction.
//! 5. Roll back and replay if step 4 found one.
//! 6. At the checksum interval, CRC the saved state and send CMD_CRC.
//!
//! `update` never stalls the emulator; it reports `false` only once the
//! connection is gone.
//!
//! ## Concurrency
//!
//! The engine lives on the emulator's main thread. One mutex guards the
//! rings and frame counters against getter calls from a UI thread. The
//! input path the core polls ([`InputLanes`]) is lock-free: `update` holds
//! the mutex across `run_frame`, and the core queries inputs from inside
//! that call.

mod frame_ring;
mod lanes;

pub use frame_ring::RING_FRAMES;
pub use lanes::InputLanes;

use std::net::TcpStream;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::checksum;
use crate::error::NetplayError;
use crate::protocol::{self, cmd, codec, wire};
use crate::{EmulatorCore, Frame};

use frame_ring::{FrameRing, SavedStates};
use lanes::SharedLanes;

/// Frames between CMD_CRC exchanges; 1 checksums every frame, 0 also means
/// every frame. Raising it saves CPU at the cost of later desync detection.
pub const CRC_INTERVAL: u32 = 1;

/// Deadline for reading the remainder of a command once its envelope has
/// arrived. The peer has already framed the packet, so this only triggers
/// on a stalled or vanished connection.
const DRAIN_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Deadline for streaming in a server-pushed savestate, which can run to
/// hundreds of kilobytes.
const SAVESTATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Session init failure. The stream is handed back so the caller can close
/// it or retry; ownership only transfers on success.
#[derive(Debug)]
pub struct InitError {
    /// Why the session could not be created.
    pub reason: NetplayError,
    /// The TCP stream the caller passed in, returned untouched.
    pub stream: TcpStream,
}

impl std::fmt::Display for InitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rollback session init failed: {}", self.reason)
    }
}

impl std::error::Error for InitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.reason)
    }
}

/// Engine state guarded by the session mutex.
struct EngineState {
    /// The connection to the host. `None` once the session disconnects.
    stream: Option<TcpStream>,
    frames: FrameRing,
    states: SavedStates,
    client_num: u32,
    start_frame: Frame,
    /// The frame the emulator is about to execute. Advanced only by
    /// `post_frame`, except when a server savestate rewrites it.
    self_frame: Frame,
    /// Highest frame the host has confirmed input for; the prediction
    /// source.
    read_frame: Frame,
}

/// A rollback netplay session with one RetroArch host.
///
/// Owned by the emulator's main thread. `update` and `post_frame` bracket
/// each emulated frame; the remaining methods are cheap status surfaces a
/// UI thread may call concurrently.
pub struct RollbackSession {
    state: Mutex<EngineState>,
    shared: Arc<SharedLanes>,
}

impl RollbackSession {
    /// Creates a session over a handshaken connection.
    ///
    /// `client_num` and `start_frame` come from the handshake outcome. The
    /// state ring is sized by `core.serialize_size()`, queried once; a zero
    /// size fails and returns the stream to the caller. On success an
    /// initial snapshot for `start_frame` is saved and the session reports
    /// active and connected.
    pub fn new(
        stream: TcpStream,
        core: &mut dyn EmulatorCore,
        client_num: u32,
        start_frame: Frame,
    ) -> Result<Self, InitError> {
        let state_size = core.serialize_size();
        if state_size == 0 {
            return Err(InitError {
                reason: NetplayError::ZeroStateSize,
                stream,
            });
        }

        let shared = Arc::new(SharedLanes::new());
        let mut st = EngineState {
            stream: Some(stream),
            frames: FrameRing::new(),
            states: SavedStates::new(state_size),
            client_num,
            start_frame,
            self_frame: start_frame,
            read_frame: start_frame,
        };

        if !save_state(&mut st, core, start_frame) {
            warn!(
                frame = start_frame.as_u32(),
                "initial snapshot failed; first rollback target is unavailable"
            );
        }

        shared.set_current_frame(start_frame);
        shared.active.store(true, Ordering::Relaxed);
        shared.connected.store(true, Ordering::Relaxed);
        shared.set_status("Rollback active");
        info!(
            client_num,
            start_frame = start_frame.as_u32(),
            state_size,
            "rollback session started"
        );

        Ok(Self {
            state: Mutex::new(st),
            shared,
        })
    }

    /// Runs the pre-frame half of a tick. Returns whether the emulator
    /// should execute the frame; `false` means the connection is gone.
    pub fn update(&mut self, core: &mut dyn EmulatorCore, local_input: u16) -> bool {
        if !self.is_active() {
            return false;
        }
        let mut guard = self.state.lock();
        let st = &mut *guard;

        // 1. Slot bookkeeping. The prediction repeats the most recent
        // confirmed remote input; before any confirmation it stays zero.
        let predicted = if st.read_frame >= st.start_frame {
            st.frames.slot(st.read_frame).remote_input
        } else {
            0
        };
        let frame = st.self_frame;
        let slot = st.frames.slot_mut(frame);
        if !slot.remote_confirmed {
            slot.remote_input = predicted;
        }
        slot.local_input = local_input;
        let remote_now = slot.remote_input;
        self.shared.store_slot(frame, remote_now, local_input);

        // 2. Snapshot before the frame runs, so it can be rewound to.
        save_state(st, core, frame);

        // 3. Our input goes out before we look at theirs.
        if let Some(stream) = st.stream.as_ref() {
            if let Err(e) = protocol::send_input(stream, frame, st.client_num, local_input) {
                warn!(error = %e, "input send failed; dropping connection");
                drop_connection(st, &self.shared, "Disconnected");
                return false;
            }
        }

        // 4. Drain everything the host sent since last tick.
        let oldest_wrong = process_incoming(st, core, &self.shared);
        if !self.shared.connected.load(Ordering::Relaxed) {
            return false;
        }

        // 5. Rewind and replay if a prediction was contradicted.
        if let Some(bad) = oldest_wrong {
            let current = st.self_frame;
            if bad < current {
                rollback_replay(st, core, &self.shared, bad, current);
            }
        }

        // 6. Checksum exchange at the interval.
        if CRC_INTERVAL == 0 || st.self_frame.as_u32() % CRC_INTERVAL == 0 {
            if st.frames.slot(st.self_frame).state_saved {
                let crc = checksum::state_crc32(st.states.cell(st.self_frame));
                st.frames.slot_mut(st.self_frame).crc = crc;
                if let Some(stream) = st.stream.as_ref() {
                    if let Err(e) = protocol::send_crc(stream, st.self_frame, crc) {
                        warn!(error = %e, "crc send failed; dropping connection");
                        drop_connection(st, &self.shared, "Disconnected");
                        return false;
                    }
                }
            }
        }

        // Never stall: the emulator always runs the real frame.
        true
    }

    /// Runs the post-frame half of a tick: advances the frame counter by
    /// exactly one and claims the ring cell the new frame will use.
    pub fn post_frame(&mut self) {
        if !self.shared.active.load(Ordering::Relaxed) {
            return;
        }
        let mut st = self.state.lock();
        st.self_frame += 1;
        let frame = st.self_frame;
        st.frames.reset_slot(frame);
        self.shared.clear_slot(frame);
        self.shared.set_current_frame(frame);
    }

    /// Returns the lock-free input handle for the emulator core.
    #[must_use]
    pub fn lanes(&self) -> InputLanes {
        InputLanes::new(Arc::clone(&self.shared))
    }

    /// Joypad bitmask for a port at the frame currently executing. Port 0
    /// is the host, port 1 is this client.
    #[must_use]
    pub fn input(&self, port: usize) -> u16 {
        self.lanes().input(port)
    }

    /// Whether the engine is re-executing past frames.
    #[must_use]
    pub fn is_replaying(&self) -> bool {
        self.shared.replaying.load(Ordering::Relaxed)
    }

    /// Whether the session is initialized and still exchanging frames.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Relaxed)
            && self.shared.connected.load(Ordering::Relaxed)
    }

    /// Whether the connection to the host is up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Relaxed)
    }

    /// Whether a checksum mismatch has been observed since the last resync.
    #[must_use]
    pub fn desync_detected(&self) -> bool {
        self.shared.desync_detected.load(Ordering::Relaxed)
    }

    /// The frame the emulator is currently executing.
    #[must_use]
    pub fn current_frame(&self) -> Frame {
        self.shared.current_frame()
    }

    /// A single-line connection status suitable for display.
    #[must_use]
    pub fn status_message(&self) -> String {
        self.shared.status()
    }

    /// Tells the host we paused. Best-effort; the session keeps running.
    pub fn pause(&self) {
        if !self.shared.active.load(Ordering::Relaxed) {
            return;
        }
        let st = self.state.lock();
        if let Some(stream) = st.stream.as_ref() {
            if let Err(e) = protocol::send_command(stream, cmd::PAUSE, &[]) {
                warn!(error = %e, "pause notification failed");
            }
            self.shared.set_status("Paused");
        }
    }

    /// Tells the host we resumed.
    pub fn resume(&self) {
        if !self.shared.active.load(Ordering::Relaxed) {
            return;
        }
        let st = self.state.lock();
        if let Some(stream) = st.stream.as_ref() {
            if let Err(e) = protocol::send_command(stream, cmd::RESUME, &[]) {
                warn!(error = %e, "resume notification failed");
            }
            self.shared.set_status("Rollback active");
        }
    }

    /// Asks the server to push a savestate. Useful once
    /// [`desync_detected`](Self::desync_detected) reports a divergence;
    /// recovery itself still arrives as a server-initiated
    /// CMD_LOAD_SAVESTATE.
    pub fn request_resync(&self) {
        let st = self.state.lock();
        if let Some(stream) = st.stream.as_ref() {
            debug!("requesting savestate from server");
            if let Err(e) = protocol::send_command(stream, cmd::REQUEST_SAVESTATE, &[]) {
                warn!(error = %e, "savestate request failed");
            }
        }
    }

    /// Leaves the session: sends CMD_DISCONNECT best-effort and closes the
    /// socket. The rings stay readable until the session is dropped.
    pub fn disconnect(&mut self) {
        let mut st = self.state.lock();
        if let Some(stream) = st.stream.take() {
            let _ = protocol::send_command(&stream, cmd::DISCONNECT, &[]);
        }
        self.shared.connected.store(false, Ordering::Relaxed);
        self.shared.active.store(false, Ordering::Relaxed);
        self.shared.set_status("Disconnected");
        info!("rollback session disconnected");
    }
}

impl std::fmt::Debug for RollbackSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollbackSession")
            .field("active", &self.shared.active.load(Ordering::Relaxed))
            .field("connected", &self.shared.connected.load(Ordering::Relaxed))
            .field("current_frame", &self.shared.current_frame())
            .field("replaying", &self.is_replaying())
            .finish_non_exhaustive()
    }
}

impl Drop for RollbackSession {
    fn drop(&mut self) {
        let mut st = self.state.lock();
        if let Some(stream) = st.stream.take() {
            let _ = protocol::send_command(&stream, cmd::DISCONNECT, &[]);
        }
        self.shared.active.store(false, Ordering::Relaxed);
        self.shared.connected.store(false, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Engine internals
// ---------------------------------------------------------------------------

/// Serializes the core into the state cell for `frame`.
fn save_state(st: &mut EngineState, core: &mut dyn EmulatorCore, frame: Frame) -> bool {
    let ok = core.serialize(st.states.cell_mut(frame));
    st.frames.slot_mut(frame).state_saved = ok;
    if !ok {
        warn!(frame = frame.as_u32(), "core failed to serialize state");
    }
    ok
}

/// Restores the core from the state cell for `frame`.
fn load_state(st: &mut EngineState, core: &mut dyn EmulatorCore, frame: Frame) -> bool {
    if !st.frames.slot(frame).state_saved {
        warn!(frame = frame.as_u32(), "no saved state for rollback target");
        return false;
    }
    let ok = core.unserialize(st.states.cell(frame));
    if !ok {
        warn!(frame = frame.as_u32(), "core failed to restore state");
    }
    ok
}

fn drop_connection(st: &mut EngineState, shared: &SharedLanes, status: &'static str) {
    st.stream = None;
    shared.connected.store(false, Ordering::Relaxed);
    shared.set_status(status);
}

enum DrainOutcome {
    /// Nothing pending; the drain loop is done for this tick.
    Idle,
    /// One command processed; keep draining.
    Continue,
    /// The peer left or the transport failed; status line to show.
    Disconnect(&'static str),
}

/// Drains all pending commands. Returns the oldest frame whose confirmed
/// host input contradicts the stored prediction, if any.
fn process_incoming(
    st: &mut EngineState,
    core: &mut dyn EmulatorCore,
    shared: &SharedLanes,
) -> Option<Frame> {
    let mut oldest_wrong = None;

    loop {
        // The stream is taken out for the step so the slot and state rings
        // stay freely borrowable while the socket is read.
        let Some(stream) = st.stream.take() else { break };
        match drain_one(&stream, st, core, shared, &mut oldest_wrong) {
            DrainOutcome::Idle => {
                st.stream = Some(stream);
                break;
            },
            DrainOutcome::Continue => {
                st.stream = Some(stream);
            },
            DrainOutcome::Disconnect(status) => {
                shared.connected.store(false, Ordering::Relaxed);
                shared.set_status(status);
                break;
            },
        }
    }

    oldest_wrong
}

/// Processes at most one pending command.
fn drain_one(
    stream: &TcpStream,
    st: &mut EngineState,
    core: &mut dyn EmulatorCore,
    shared: &SharedLanes,
    oldest_wrong: &mut Option<Frame>,
) -> DrainOutcome {
    match protocol::has_pending(stream) {
        Ok(true) => {},
        Ok(false) => return DrainOutcome::Idle,
        Err(e) => {
            warn!(error = %e, "socket poll failed");
            return DrainOutcome::Disconnect("Disconnected");
        },
    }

    let deadline = Instant::now() + DRAIN_READ_TIMEOUT;
    let header = match protocol::read_header(stream, deadline) {
        Ok(header) => header,
        Err(e) => {
            warn!(error = %e, "command receive failed");
            return DrainOutcome::Disconnect("Disconnected");
        },
    };

    match header.cmd {
        cmd::INPUT => {
            let mut buf = [0u8; 32];
            let copied = match protocol::recv_payload(stream, &mut buf, header.size, deadline) {
                Ok(copied) => copied,
                Err(e) => {
                    warn!(error = %e, "input payload receive failed");
                    return DrainOutcome::Disconnect("Disconnected");
                },
            };
            let report = match protocol::parse_input(&buf[..copied]) {
                Ok(report) => report,
                Err(e) => {
                    debug!(error = %e, "ignoring malformed CMD_INPUT");
                    return DrainOutcome::Continue;
                },
            };

            // Our own input echoed back; nothing to learn from it.
            if report.player == st.client_num {
                return DrainOutcome::Continue;
            }

            let self_frame = st.self_frame;
            let slot = st.frames.slot_mut(report.frame);
            if slot.remote_confirmed {
                return DrainOutcome::Continue;
            }
            if report.frame < self_frame && slot.remote_input != report.joypad {
                trace!(
                    frame = report.frame.as_u32(),
                    predicted = slot.remote_input,
                    actual = report.joypad,
                    "misprediction detected"
                );
                *oldest_wrong = Some(match *oldest_wrong {
                    Some(frame) if frame <= report.frame => frame,
                    _ => report.frame,
                });
            }
            slot.remote_input = report.joypad;
            slot.remote_confirmed = true;
            shared.store_remote(report.frame, report.joypad);

            if report.frame > st.read_frame || st.read_frame.as_u32() == 0 {
                st.read_frame = report.frame;
            }
            DrainOutcome::Continue
        },

        cmd::CRC => {
            let mut buf = [0u8; 8];
            let copied = match protocol::recv_payload(stream, &mut buf, header.size, deadline) {
                Ok(copied) => copied,
                Err(e) => {
                    warn!(error = %e, "crc payload receive failed");
                    return DrainOutcome::Disconnect("Disconnected");
                },
            };
            if copied >= 8 {
                if let Ok(report) = codec::decode_value::<wire::CrcPayload>(&buf[..8]) {
                    let slot = st.frames.slot(Frame::new(report.frame));
                    if slot.crc != 0 && slot.crc != report.crc {
                        warn!(
                            frame = report.frame,
                            local_crc = slot.crc,
                            server_crc = report.crc,
                            "state desync detected; waiting for server resync"
                        );
                        shared.desync_detected.store(true, Ordering::Relaxed);
                    }
                }
            }
            DrainOutcome::Continue
        },

        cmd::LOAD_SAVESTATE => load_server_savestate(stream, st, core, shared, header.size),

        cmd::DISCONNECT => {
            let _ = protocol::drain_deadline(stream, header.size, deadline);
            info!("server disconnected");
            DrainOutcome::Disconnect("Server disconnected")
        },

        cmd::PAUSE => {
            shared.set_status("Server paused");
            drain_rest(stream, header.size, deadline)
        },

        cmd::RESUME => {
            shared.set_status("Rollback active");
            drain_rest(stream, header.size, deadline)
        },

        other => {
            trace!(cmd = other, size = header.size, "ignoring command");
            drain_rest(stream, header.size, deadline)
        },
    }
}

/// Discards a payload we do not interpret, keeping the stream framed.
fn drain_rest(stream: &TcpStream, size: u32, deadline: Instant) -> DrainOutcome {
    match protocol::drain_deadline(stream, size, deadline) {
        Ok(()) => DrainOutcome::Continue,
        Err(e) => {
            warn!(error = %e, "payload drain failed");
            DrainOutcome::Disconnect("Disconnected")
        },
    }
}

/// Receives a server-pushed savestate and rewinds the session onto it.
///
/// Payload: `{frame, size}` prefix, then `size` state bytes. The state goes
/// through a heap scratch buffer; the ring cells stay untouched so a failed
/// restore loses nothing. Oversized or truncated states are drained and
/// ignored.
fn load_server_savestate(
    stream: &TcpStream,
    st: &mut EngineState,
    core: &mut dyn EmulatorCore,
    shared: &SharedLanes,
    payload_size: u32,
) -> DrainOutcome {
    let deadline = Instant::now() + SAVESTATE_TIMEOUT;
    if payload_size < 8 {
        warn!(payload_size, "runt CMD_LOAD_SAVESTATE");
        return drain_rest(stream, payload_size, deadline);
    }

    let mut prefix_raw = [0u8; 8];
    if let Err(e) = protocol::recv_exact(stream, &mut prefix_raw, deadline) {
        warn!(error = %e, "savestate prefix receive failed");
        return DrainOutcome::Disconnect("Disconnected");
    }
    let remaining = payload_size - 8;
    let prefix = match codec::decode_value::<wire::SavestatePrefix>(&prefix_raw) {
        Ok(prefix) => prefix,
        Err(_) => return drain_rest(stream, remaining, deadline),
    };

    let state_size = st.states.state_size() as u32;
    if prefix.size > state_size || prefix.size > remaining {
        warn!(
            declared = prefix.size,
            state_size,
            remaining,
            "savestate size mismatch; draining"
        );
        return drain_rest(stream, remaining, deadline);
    }

    let mut scratch = vec![0u8; prefix.size as usize];
    if let Err(e) = protocol::recv_exact(stream, &mut scratch, deadline) {
        warn!(error = %e, "savestate receive failed");
        return DrainOutcome::Disconnect("Disconnected");
    }
    if remaining > prefix.size {
        if let Err(e) = protocol::drain_deadline(stream, remaining - prefix.size, deadline) {
            warn!(error = %e, "savestate trailer drain failed");
            return DrainOutcome::Disconnect("Disconnected");
        }
    }

    if core.unserialize(&scratch) {
        st.self_frame = Frame::new(prefix.frame);
        shared.set_current_frame(st.self_frame);
        shared.desync_detected.store(false, Ordering::Relaxed);
        shared.set_status(format!("Resync from server (frame {})", prefix.frame));
        info!(
            frame = prefix.frame,
            bytes = prefix.size,
            "resynced from server savestate"
        );
    } else {
        warn!(frame = prefix.frame, "core rejected server savestate");
    }
    DrainOutcome::Continue
}

/// Rewinds to `from` and re-executes every frame up to, but not including,
/// `to`. Each replayed frame re-saves its successor's snapshot and refreshes
/// the checksum at the interval.
///
/// A gap that reaches the ring size cannot be replayed: the snapshot for
/// `from` has already been overwritten. The engine keeps running with
/// uncorrected state and relies on the server pushing a savestate.
fn rollback_replay(
    st: &mut EngineState,
    core: &mut dyn EmulatorCore,
    shared: &Arc<SharedLanes>,
    from: Frame,
    to: Frame,
) {
    if from >= to {
        return;
    }
    let depth = to - from;
    if depth as usize >= RING_FRAMES {
        warn!(
            from = from.as_u32(),
            to = to.as_u32(),
            depth,
            "too many frames to replay; waiting for server resync"
        );
        return;
    }
    if !load_state(st, core, from) {
        return;
    }

    debug!(
        from = from.as_u32(),
        to = to.as_u32(),
        depth,
        "rolling back"
    );

    let lanes = InputLanes::new(Arc::clone(shared));
    shared.replaying.store(true, Ordering::Relaxed);
    let mut frame = from;
    while frame < to {
        shared.set_replay_frame(frame);
        core.run_frame(&lanes);

        // The state after running frame f is the state at frame f + 1.
        save_state(st, core, frame + 1);
        if CRC_INTERVAL == 0 || frame.as_u32() % CRC_INTERVAL == 0 {
            if st.frames.slot(frame + 1).state_saved {
                let crc = checksum::state_crc32(st.states.cell(frame + 1));
                st.frames.slot_mut(frame + 1).crc = crc;
            }
        }
        frame += 1;
    }
    shared.replaying.store(false, Ordering::Relaxed);
}
