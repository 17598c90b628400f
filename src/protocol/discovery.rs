//! LAN host discovery.
//!
//! Discovery is an unreliable-datagram broadcast protocol: the client
//! broadcasts a 4-byte query magic to UDP port 55435 and hosts answer with a
//! fixed-size ad packet describing the session. Responses are collected
//! non-blockingly and deduplicated by sender address; a UI polls the
//! accumulated set while the query is repeated.
//!
//! The ad packet's port field is declared signed on the wire even though
//! ports fit in 16 bits; it is decoded as a signed big-endian word and then
//! truncated. The advertised TCP port is what we must connect to, it is not
//! assumed to equal the discovery port.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use tracing::{debug, warn};

use super::{HOST_LONGSTR_LEN, HOST_STR_LEN, NICK_LEN};
use crate::error::NetplayError;

/// The UDP port hosts listen on for discovery queries.
pub const DISCOVERY_PORT: u16 = 55435;

/// Query magic broadcast by clients ("RANQ").
pub const QUERY_MAGIC: u32 = 0x5241_4E51;

/// Response magic leading every host ad packet ("RANS").
pub const RESPONSE_MAGIC: u32 = 0x5241_4E53;

/// Size of a host ad packet. Packets shorter than this are ignored.
pub const AD_PACKET_LEN: usize = 688;

// Ad packet field offsets. The layout is fixed by the peer:
// header, content_crc, port, has_password, then five short strings and two
// long strings, all zero-padded.
const OFF_CONTENT_CRC: usize = 4;
const OFF_PORT: usize = 8;
const OFF_NICK: usize = 16;
const OFF_CORE: usize = OFF_NICK + NICK_LEN + HOST_STR_LEN; // frontend skipped
const OFF_CORE_VERSION: usize = OFF_CORE + HOST_STR_LEN;
const OFF_CONTENT: usize = OFF_CORE_VERSION + HOST_STR_LEN * 2; // retroarch_version skipped

/// A netplay host that answered a discovery query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredHost {
    /// Address the response came from.
    pub addr: IpAddr,
    /// TCP port the host accepts netplay connections on.
    pub port: u16,
    /// CRC32 of the content the host is running.
    pub content_crc: u32,
    /// The host's nickname.
    pub nick: String,
    /// Core library name the host is running.
    pub core: String,
    /// Core library version the host is running.
    pub core_version: String,
    /// Human-readable content name.
    pub content: String,
}

/// Broadcasts one discovery query. The socket is switched to broadcast mode;
/// the caller keeps ownership and reuses it for [`receive_responses`].
pub fn send_query(socket: &UdpSocket) -> Result<(), NetplayError> {
    socket.set_broadcast(true).map_err(NetplayError::Io)?;
    let target = SocketAddr::from((Ipv4Addr::BROADCAST, DISCOVERY_PORT));
    let sent = socket
        .send_to(&QUERY_MAGIC.to_be_bytes(), target)
        .map_err(NetplayError::Io)?;
    if sent != 4 {
        return Err(NetplayError::Io(io::Error::new(
            io::ErrorKind::WriteZero,
            "short discovery query write",
        )));
    }
    debug!("discovery query broadcast");
    Ok(())
}

/// Drains all pending responses from the socket into `hosts`, deduplicating
/// by sender address and stopping at `cap` entries. Never blocks. Returns
/// the total host count.
pub fn receive_responses(
    socket: &UdpSocket,
    hosts: &mut Vec<DiscoveredHost>,
    cap: usize,
) -> usize {
    if socket.set_nonblocking(true).is_err() {
        return hosts.len();
    }

    let mut packet = [0u8; 1024];
    loop {
        match socket.recv_from(&mut packet) {
            Ok((len, sender)) => {
                let Some(host) = parse_ad_packet(&packet[..len], sender.ip()) else {
                    continue;
                };
                if hosts.iter().any(|h| h.addr == host.addr) {
                    continue;
                }
                if hosts.len() >= cap {
                    continue;
                }
                debug!(
                    addr = %host.addr,
                    port = host.port,
                    nick = %host.nick,
                    core = %host.core,
                    content = %host.content,
                    "discovered netplay host"
                );
                hosts.push(host);
            },
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            // Datagram sockets can report a stale send failure here; skip it.
            Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
            Err(e) => {
                warn!(error = %e, "discovery receive failed");
                break;
            },
        }
    }

    hosts.len()
}

/// Parses one ad packet. Returns `None` for runts and packets that do not
/// carry the response magic.
fn parse_ad_packet(packet: &[u8], sender: IpAddr) -> Option<DiscoveredHost> {
    if packet.len() < AD_PACKET_LEN {
        return None;
    }
    if be_u32(packet, 0) != RESPONSE_MAGIC {
        return None;
    }

    // Signed on the wire; ports only occupy the low 16 bits.
    let port = be_u32(packet, OFF_PORT) as u16;

    Some(DiscoveredHost {
        addr: sender,
        port,
        content_crc: be_u32(packet, OFF_CONTENT_CRC),
        nick: super::wire::fixed_to_string(&packet[OFF_NICK..OFF_NICK + NICK_LEN]),
        core: super::wire::fixed_to_string(&packet[OFF_CORE..OFF_CORE + HOST_STR_LEN]),
        core_version: super::wire::fixed_to_string(
            &packet[OFF_CORE_VERSION..OFF_CORE_VERSION + HOST_STR_LEN],
        ),
        content: super::wire::fixed_to_string(
            &packet[OFF_CONTENT..OFF_CONTENT + HOST_LONGSTR_LEN],
        ),
    })
}

fn be_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}
