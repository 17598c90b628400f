//! Shared test infrastructure: a deterministic stub core and loopback
//! socket helpers that stand in for a RetroArch host.

// Each integration suite compiles this module separately and uses a
// different subset of it.
#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ra_rollback::{EmulatorCore, InputLanes};

/// What the stub core observed during one `run_frame` call.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameRecord {
    pub p0: u16,
    pub p1: u16,
    pub replaying: bool,
}

/// Serializable state of the stub core.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct CoreState {
    pub frames_run: u32,
    pub acc: u32,
}

/// A deterministic stand-in for an emulator core: eight bytes of state, a
/// frame counter and an input-dependent accumulator, plus a log of every
/// input pair it polled so replay behavior is assertable.
pub struct CounterCore {
    pub state: CoreState,
    pub log: Arc<Mutex<Vec<FrameRecord>>>,
}

impl CounterCore {
    pub fn new() -> Self {
        Self {
            state: CoreState::default(),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn log_handle(&self) -> Arc<Mutex<Vec<FrameRecord>>> {
        Arc::clone(&self.log)
    }
}

impl EmulatorCore for CounterCore {
    fn serialize_size(&mut self) -> usize {
        8
    }

    fn serialize(&mut self, buf: &mut [u8]) -> bool {
        assert_eq!(buf.len(), 8, "engine must pass exactly one state cell");
        buf[..4].copy_from_slice(&self.state.frames_run.to_le_bytes());
        buf[4..8].copy_from_slice(&self.state.acc.to_le_bytes());
        true
    }

    fn unserialize(&mut self, buf: &[u8]) -> bool {
        if buf.len() != 8 {
            return false;
        }
        self.state.frames_run = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        self.state.acc = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        true
    }

    fn run_frame(&mut self, inputs: &InputLanes) {
        let p0 = inputs.input(0);
        let p1 = inputs.input(1);
        self.log.lock().unwrap().push(FrameRecord {
            p0,
            p1,
            replaying: inputs.is_replaying(),
        });
        self.state.frames_run = self.state.frames_run.wrapping_add(1);
        self.state.acc = self
            .state
            .acc
            .wrapping_mul(31)
            .wrapping_add(u32::from(p0) * 7 + u32::from(p1));
    }
}

/// Encodes the stub core's state the way `CounterCore::serialize` does.
pub fn core_state_bytes(frames_run: u32, acc: u32) -> [u8; 8] {
    let mut bytes = [0u8; 8];
    bytes[..4].copy_from_slice(&frames_run.to_le_bytes());
    bytes[4..8].copy_from_slice(&acc.to_le_bytes());
    bytes
}

/// Installs a test subscriber so engine logs surface in failing tests.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// A connected loopback pair: (client side, host side).
pub fn tcp_pair() -> (TcpStream, TcpStream) {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    client.set_nodelay(true).unwrap();
    server.set_nodelay(true).unwrap();
    (client, server)
}

/// Writes one framed command from the host side: 8-byte big-endian envelope
/// followed by the payload.
pub fn host_send_cmd(host: &mut TcpStream, cmd: u32, payload: &[u8]) {
    let mut packet = Vec::with_capacity(8 + payload.len());
    packet.extend_from_slice(&cmd.to_be_bytes());
    packet.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    packet.extend_from_slice(payload);
    host.write_all(&packet).unwrap();
}

/// Sends CMD_INPUT from the host side.
pub fn host_send_input(
    host: &mut TcpStream,
    frame: u32,
    player: u32,
    joypad: u16,
    is_server: bool,
) {
    let mut payload = Vec::with_capacity(12);
    payload.extend_from_slice(&frame.to_be_bytes());
    let player_word = (u32::from(is_server) << 31) | (player & 0x7FFF_FFFF);
    payload.extend_from_slice(&player_word.to_be_bytes());
    payload.extend_from_slice(&u32::from(joypad).to_be_bytes());
    host_send_cmd(host, 0x0003, &payload);
}

/// Sends CMD_CRC from the host side.
pub fn host_send_crc(host: &mut TcpStream, frame: u32, crc: u32) {
    let mut payload = Vec::with_capacity(8);
    payload.extend_from_slice(&frame.to_be_bytes());
    payload.extend_from_slice(&crc.to_be_bytes());
    host_send_cmd(host, 0x0040, &payload);
}

/// Sends CMD_LOAD_SAVESTATE from the host side.
pub fn host_send_savestate(host: &mut TcpStream, frame: u32, state: &[u8]) {
    let mut payload = Vec::with_capacity(8 + state.len());
    payload.extend_from_slice(&frame.to_be_bytes());
    payload.extend_from_slice(&(state.len() as u32).to_be_bytes());
    payload.extend_from_slice(state);
    host_send_cmd(host, 0x0042, &payload);
}

/// Reads exactly `n` bytes from the host side.
pub fn host_read_exact(host: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    host.read_exact(&mut buf).unwrap();
    buf
}

/// Gives loopback delivery a moment so the next `update` sees the data.
pub fn settle() {
    std::thread::sleep(Duration::from_millis(150));
}
