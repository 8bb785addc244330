//! Spoofed disconnect datagrams
//!
//! When the server keeps pushing upload packets at a client that never
//! answers, the watchdog impersonates the client and tells the server to close
//! the upload. The body is derived from two 16-bit fields of the triggering
//! server packet:
//!
//! ```text
//! trigger:  fe fe xx A_hi A_lo B_hi B_lo ...
//! body:     fe fe 06 B_hi B_lo (A+1)_hi (A+1)_lo
//! ```
//!
//! The body is wrapped in a UDP datagram from the client port to the server
//! port, inside an IPv4 header carrying the client as source address. Sending
//! it requires a raw socket with a hand-built IP header.

use crate::error::SendError;
use etherparse::{IpHeaders, IpNumber, Ipv4Extensions, Ipv4Header, PacketBuilder};
use log::debug;
use shared::{FlowKey, CLOSE_UPLOAD_COMMAND, PACKET_MARKER};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Mutex, PoisonError};

pub const DISCONNECT_BODY_LEN: usize = 7;
pub const DEFAULT_TTL: u8 = 64;

const IPPROTO_RAW: i32 = 255;

/// Builds the 7-byte close-upload body from a triggering server payload.
///
/// Returns `None` if the payload is too short to hold both fields.
pub fn disconnect_body(trigger: &[u8]) -> Option<[u8; DISCONNECT_BODY_LEN]> {
    let a = u16::from_be_bytes([*trigger.get(3)?, *trigger.get(4)?]);
    let b = [*trigger.get(5)?, *trigger.get(6)?];
    let [a_hi, a_lo] = a.wrapping_add(1).to_be_bytes();

    Some([
        PACKET_MARKER[0],
        PACKET_MARKER[1],
        CLOSE_UPLOAD_COMMAND,
        b[0],
        b[1],
        a_hi,
        a_lo,
    ])
}

/// Wraps `body` into an IPv4/UDP datagram that appears to come from the client of `flow`
pub fn build_datagram(flow: &FlowKey, body: &[u8]) -> Result<Vec<u8>, SendError> {
    let header = Ipv4Header {
        dont_fragment: true,
        time_to_live: DEFAULT_TTL,
        protocol: IpNumber::UDP,
        source: flow.client_addr.octets(),
        destination: flow.server_addr.octets(),
        ..Default::default()
    };

    let builder = PacketBuilder::ip(IpHeaders::Ipv4(header, Ipv4Extensions::default()))
        .udp(flow.client_port, flow.server_port);

    let mut datagram = Vec::with_capacity(builder.size(body.len()));
    builder
        .write(&mut datagram, body)
        .map_err(|e| SendError::BuildFailed(format!("{:?}", e)))?;
    Ok(datagram)
}

/// Raw network-send capability able to spoof the source address
pub trait DatagramSender: Send + Sync {
    fn send(&self, datagram: &[u8], destination: Ipv4Addr) -> Result<(), SendError>;
}

/// Sends through an `IPPROTO_RAW` socket, which implies `IP_HDRINCL`.
///
/// The socket is opened on first use. Opening needs `CAP_NET_RAW`; if it
/// fails the send is abandoned and the next send tries again.
#[derive(Default)]
pub struct RawSocketSender {
    socket: Mutex<Option<Socket>>,
}

impl RawSocketSender {
    pub fn new() -> Self {
        Self::default()
    }

    fn open() -> Result<Socket, SendError> {
        Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::from(IPPROTO_RAW)))
            .map_err(SendError::SocketUnavailable)
    }
}

impl DatagramSender for RawSocketSender {
    fn send(&self, datagram: &[u8], destination: Ipv4Addr) -> Result<(), SendError> {
        let mut socket = self.socket.lock().unwrap_or_else(PoisonError::into_inner);
        if socket.is_none() {
            *socket = Some(Self::open()?);
            debug!("Opened raw socket for spoofed datagrams");
        }

        if let Some(socket) = socket.as_ref() {
            let target = SockAddr::from(SocketAddrV4::new(destination, 0));
            socket.send_to(datagram, &target)?;
        }
        Ok(())
    }
}
