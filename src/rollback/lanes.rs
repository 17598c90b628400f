//! The lock-free input view polled by the emulator core.
//!
//! `get_input` is reentrant: the core calls it from inside `run_frame`
//! while the engine holds its mutex across the replay loop, so this path
//! must never touch that mutex. Instead the engine mirrors each frame
//! slot's input pair into one packed atomic word, and the flags that select
//! which frame to read come from atomics as well.
//!
//! There is a single writer (the engine, on the emulator thread). Readers
//! on other threads may observe a stale word; the next tick overwrites it,
//! so relaxed loads are sufficient everywhere.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::frame_ring::{ring_index, RING_FRAMES};
use crate::Frame;

/// Engine state shared with lock-free readers: the input mirror, the replay
/// cursor, connection flags and the status line.
pub(crate) struct SharedLanes {
    /// One word per ring slot: `remote << 16 | local`.
    slots: [AtomicU32; RING_FRAMES],
    /// The frame the emulator is currently executing.
    current_frame: AtomicU32,
    /// The frame being re-executed while `replaying` is set.
    replay_frame: AtomicU32,
    pub(crate) replaying: AtomicBool,
    pub(crate) active: AtomicBool,
    pub(crate) connected: AtomicBool,
    pub(crate) desync_detected: AtomicBool,
    status: Mutex<String>,
}

impl SharedLanes {
    pub(crate) fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicU32::new(0)),
            current_frame: AtomicU32::new(0),
            replay_frame: AtomicU32::new(0),
            replaying: AtomicBool::new(false),
            active: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            desync_detected: AtomicBool::new(false),
            status: Mutex::new(String::new()),
        }
    }

    /// Mirrors a slot's input pair for lock-free readers.
    pub(crate) fn store_slot(&self, frame: Frame, remote: u16, local: u16) {
        let word = (u32::from(remote) << 16) | u32::from(local);
        self.slots[ring_index(frame)].store(word, Ordering::Relaxed);
    }

    /// Updates only the remote half of a slot's mirror.
    pub(crate) fn store_remote(&self, frame: Frame, remote: u16) {
        let slot = &self.slots[ring_index(frame)];
        let local = slot.load(Ordering::Relaxed) & 0xFFFF;
        slot.store((u32::from(remote) << 16) | local, Ordering::Relaxed);
    }

    pub(crate) fn clear_slot(&self, frame: Frame) {
        self.slots[ring_index(frame)].store(0, Ordering::Relaxed);
    }

    pub(crate) fn set_current_frame(&self, frame: Frame) {
        self.current_frame.store(frame.as_u32(), Ordering::Relaxed);
    }

    pub(crate) fn current_frame(&self) -> Frame {
        Frame::new(self.current_frame.load(Ordering::Relaxed))
    }

    pub(crate) fn set_replay_frame(&self, frame: Frame) {
        self.replay_frame.store(frame.as_u32(), Ordering::Relaxed);
    }

    pub(crate) fn set_status(&self, status: impl Into<String>) {
        *self.status.lock() = status.into();
    }

    pub(crate) fn status(&self) -> String {
        self.status.lock().clone()
    }
}

/// Cloneable handle the emulator core uses to poll controller input.
///
/// Port mapping is fixed for a two-player session: the host is port 0, this
/// client is port 1. During a replay the handle reads from the frame being
/// re-executed instead of the current one, so the core sees the corrected
/// input stream without doing anything special.
#[derive(Clone)]
pub struct InputLanes {
    shared: Arc<SharedLanes>,
}

impl InputLanes {
    pub(crate) fn new(shared: Arc<SharedLanes>) -> Self {
        Self { shared }
    }

    /// Returns the joypad bitmask for a port at the frame currently being
    /// executed (the replay frame while a rollback is re-running).
    #[must_use]
    pub fn input(&self, port: usize) -> u16 {
        let frame = if self.shared.replaying.load(Ordering::Relaxed) {
            Frame::new(self.shared.replay_frame.load(Ordering::Relaxed))
        } else {
            self.shared.current_frame()
        };
        let word = self.shared.slots[ring_index(frame)].load(Ordering::Relaxed);
        if port == 0 {
            (word >> 16) as u16
        } else {
            word as u16
        }
    }

    /// Whether the engine is re-executing past frames. The core must
    /// suppress audio and video output while this is set.
    #[must_use]
    pub fn is_replaying(&self) -> bool {
        self.shared.replaying.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for InputLanes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputLanes")
            .field("replaying", &self.is_replaying())
            .field("current_frame", &self.shared.current_frame())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_reads_current_frame_slot() {
        let shared = Arc::new(SharedLanes::new());
        shared.set_current_frame(Frame::new(100));
        shared.store_slot(Frame::new(100), 0x00AA, 0x0010);

        let lanes = InputLanes::new(shared);
        assert_eq!(lanes.input(0), 0x00AA);
        assert_eq!(lanes.input(1), 0x0010);
    }

    #[test]
    fn test_input_follows_replay_cursor() {
        let shared = Arc::new(SharedLanes::new());
        shared.set_current_frame(Frame::new(105));
        shared.store_slot(Frame::new(105), 0, 0);
        shared.store_slot(Frame::new(102), 0x0040, 0x0003);

        let lanes = InputLanes::new(shared.clone());
        assert_eq!(lanes.input(0), 0);

        shared.set_replay_frame(Frame::new(102));
        shared.replaying.store(true, Ordering::Relaxed);
        assert!(lanes.is_replaying());
        assert_eq!(lanes.input(0), 0x0040);
        assert_eq!(lanes.input(1), 0x0003);

        shared.replaying.store(false, Ordering::Relaxed);
        assert_eq!(lanes.input(0), 0);
    }

    #[test]
    fn test_store_remote_preserves_local_half() {
        let shared = Arc::new(SharedLanes::new());
        shared.set_current_frame(Frame::new(7));
        shared.store_slot(Frame::new(7), 0, 0x1234);
        shared.store_remote(Frame::new(7), 0x00FF);

        let lanes = InputLanes::new(shared);
        assert_eq!(lanes.input(0), 0x00FF);
        assert_eq!(lanes.input(1), 0x1234);
    }

    #[test]
    fn test_ports_beyond_one_read_local() {
        let shared = Arc::new(SharedLanes::new());
        shared.set_current_frame(Frame::new(0));
        shared.store_slot(Frame::new(0), 0xAAAA, 0xBBBB);
        let lanes = InputLanes::new(shared);
        assert_eq!(lanes.input(2), 0xBBBB);
    }

    #[test]
    fn test_status_line() {
        let shared = SharedLanes::new();
        shared.set_status("Rollback active");
        assert_eq!(shared.status(), "Rollback active");
        shared.set_status(format!("Resync from server (frame {})", 480));
        assert_eq!(shared.status(), "Resync from server (frame 480)");
    }
}
