//! Client handshake against a scripted mock host.

mod common;

use std::io::Write;
use std::net::TcpStream;
use std::thread;

use common::{host_read_exact, host_send_cmd, host_send_input, tcp_pair};
use ra_rollback::protocol::RA_MAGIC;
use ra_rollback::{client_handshake, Frame, HandshakeContext, NetplayError};

fn test_context() -> HandshakeContext {
    HandshakeContext {
        nick: "handheld".into(),
        content_crc: 0xAABB_CCDD,
        core_name: "snes9x".into(),
        core_version: "1.62".into(),
    }
}

fn write_server_hello(host: &mut TcpStream, magic: u32, salt: u32, proto: u32, compression: u32) {
    let mut hello = Vec::with_capacity(24);
    for word in [magic, 0x5241_5243, compression, salt, proto, 0x5241_5243] {
        hello.extend_from_slice(&word.to_be_bytes());
    }
    host.write_all(&hello).unwrap();
}

fn write_nick(host: &mut TcpStream, nick: &str) {
    let mut field = [0u8; 32];
    field[..nick.len()].copy_from_slice(nick.as_bytes());
    host_send_cmd(host, 0x0020, &field);
}

fn write_sync(host: &mut TcpStream, frame: u32, connections: u32, client_num: u32) {
    let mut payload = Vec::new();
    payload.extend_from_slice(&frame.to_be_bytes());
    payload.extend_from_slice(&connections.to_be_bytes());
    payload.extend_from_slice(&client_num.to_be_bytes());
    payload.extend_from_slice(&[0u8; 64]); // share modes and device tables
    host_send_cmd(host, 0x0023, &payload);
}

fn write_mode(host: &mut TcpStream, frame: u32, flags: u32) {
    let mut payload = Vec::new();
    payload.extend_from_slice(&frame.to_be_bytes());
    payload.extend_from_slice(&flags.to_be_bytes());
    payload.extend_from_slice(&[0u8; 52]); // devices, share modes, nick
    host_send_cmd(host, 0x0026, &payload);
}

/// Runs the host side of a successful handshake up to (not including) the
/// MODE response, verifying what the client sends along the way.
fn run_host_until_play(host: &mut TcpStream) {
    // Client connection header.
    let hello = host_read_exact(host, 24);
    assert_eq!(&hello[..4], &RA_MAGIC.to_be_bytes());
    assert_eq!(&hello[8..12], &[0, 0, 0, 0], "client must not request compression");

    write_server_hello(host, RA_MAGIC, 0, 6, 0);

    // CMD_NICK from the client: fixed 32-byte field.
    let nick = host_read_exact(host, 8 + 32);
    assert_eq!(&nick[..4], &[0, 0, 0, 0x20]);
    assert_eq!(&nick[8..16], b"handheld");

    write_nick(host, "host");

    // The server announces its content before the client does.
    host_send_cmd(host, 0x0022, &[0u8; 68]);

    // CMD_INFO from the client: content CRC plus core name/version.
    let info = host_read_exact(host, 8 + 68);
    assert_eq!(&info[..4], &[0, 0, 0, 0x22]);
    assert_eq!(&info[8..12], &0xAABB_CCDDu32.to_be_bytes());
    assert_eq!(&info[12..18], b"snes9x");

    write_sync(host, 1000, 1, 1);

    // CMD_PLAY: a single zero word requesting auto-assignment.
    let play = host_read_exact(host, 8 + 4);
    assert_eq!(&play[..4], &[0, 0, 0, 0x25]);
    assert_eq!(&play[8..12], &[0, 0, 0, 0]);
}

#[test]
fn handshake_succeeds_against_scripted_host() {
    let (client, mut host) = tcp_pair();

    let server = thread::spawn(move || {
        run_host_until_play(&mut host);
        // Interleaved traffic before the MODE broadcast must be consumed.
        host_send_input(&mut host, 1000, 0, 0, true);
        // A MODE for someone else is dropped.
        write_mode(&mut host, 1000, (1 << 30) | 2);
        // Ours: YOU | PLAYING | client 1.
        write_mode(&mut host, 1000, (1 << 31) | (1 << 30) | 1);
    });

    let outcome = client_handshake(&client, &test_context()).unwrap();
    server.join().unwrap();

    assert_eq!(outcome.negotiated_proto, 6);
    assert_eq!(outcome.client_num, 1);
    assert_eq!(outcome.start_frame, Frame::new(1000));
    assert_eq!(outcome.server_nick, "host");
}

#[test]
fn handshake_takes_later_mode_frame() {
    let (client, mut host) = tcp_pair();

    let server = thread::spawn(move || {
        run_host_until_play(&mut host);
        // The server schedules our first input frame after SYNC's counter.
        write_mode(&mut host, 1010, (1 << 31) | (1 << 30) | 1);
    });

    let outcome = client_handshake(&client, &test_context()).unwrap();
    server.join().unwrap();
    assert_eq!(outcome.start_frame, Frame::new(1010));
}

#[test]
fn handshake_keeps_sync_frame_when_mode_is_older() {
    let (client, mut host) = tcp_pair();

    let server = thread::spawn(move || {
        run_host_until_play(&mut host);
        write_mode(&mut host, 900, (1 << 31) | (1 << 30) | 1);
    });

    let outcome = client_handshake(&client, &test_context()).unwrap();
    server.join().unwrap();
    assert_eq!(outcome.start_frame, Frame::new(1000));
}

#[test]
fn handshake_rejects_bad_magic() {
    let (client, mut host) = tcp_pair();

    let server = thread::spawn(move || {
        let _ = host_read_exact(&mut host, 24);
        write_server_hello(&mut host, 0x1111_1111, 0, 6, 0);
    });

    let err = client_handshake(&client, &test_context()).unwrap_err();
    server.join().unwrap();
    assert!(matches!(err, NetplayError::BadMagic { found: 0x1111_1111 }));
}

#[test]
fn handshake_rejects_password_demand() {
    let (client, mut host) = tcp_pair();

    let server = thread::spawn(move || {
        let _ = host_read_exact(&mut host, 24);
        write_server_hello(&mut host, RA_MAGIC, 0xDEAD_5EED, 6, 0);
    });

    let err = client_handshake(&client, &test_context()).unwrap_err();
    server.join().unwrap();
    assert!(matches!(err, NetplayError::PasswordRequired));
}

#[test]
fn handshake_rejects_unsupported_protocol() {
    let (client, mut host) = tcp_pair();

    let server = thread::spawn(move || {
        let _ = host_read_exact(&mut host, 24);
        write_server_hello(&mut host, RA_MAGIC, 0, 5, 0);
    });

    let err = client_handshake(&client, &test_context()).unwrap_err();
    server.join().unwrap();
    assert!(matches!(
        err,
        NetplayError::UnsupportedProtocol { version: 5 }
    ));
}

#[test]
fn handshake_rejects_compression() {
    let (client, mut host) = tcp_pair();

    let server = thread::spawn(move || {
        let _ = host_read_exact(&mut host, 24);
        write_server_hello(&mut host, RA_MAGIC, 0, 6, 1);
    });

    let err = client_handshake(&client, &test_context()).unwrap_err();
    server.join().unwrap();
    assert!(matches!(
        err,
        NetplayError::CompressionUnsupported { mode: 1 }
    ));
}

#[test]
fn handshake_fails_when_play_is_refused() {
    let (client, mut host) = tcp_pair();

    let server = thread::spawn(move || {
        run_host_until_play(&mut host);
        // YOU without PLAYING: we were relegated to spectator.
        write_mode(&mut host, 1000, 1 << 31);
    });

    let err = client_handshake(&client, &test_context()).unwrap_err();
    server.join().unwrap();
    assert!(matches!(err, NetplayError::PlayRefused));
}

#[test]
fn handshake_fails_when_sync_is_wrong_command() {
    let (client, mut host) = tcp_pair();

    let server = thread::spawn(move || {
        let _ = host_read_exact(&mut host, 24);
        write_server_hello(&mut host, RA_MAGIC, 0, 6, 0);
        let _ = host_read_exact(&mut host, 8 + 32);
        write_nick(&mut host, "host");
        host_send_cmd(&mut host, 0x0022, &[0u8; 68]);
        let _ = host_read_exact(&mut host, 8 + 68);
        // PAUSE where SYNC belongs.
        host_send_cmd(&mut host, 0x0043, &[]);
    });

    let err = client_handshake(&client, &test_context()).unwrap_err();
    server.join().unwrap();
    assert!(matches!(
        err,
        NetplayError::WrongCommand {
            expected: 0x0023,
            found: 0x0043,
        }
    ));
}
