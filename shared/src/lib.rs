use std::fmt;
use std::net::Ipv4Addr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Capture timestamps are durations since the UNIX epoch. They come from the
/// capture source, not the local clock, so replayed traffic keeps its timing.
pub type Timestamp = Duration;

/// Payload lengths of the keepalives the server keeps sending even while it is
/// frozen on a save error popup. They do not prove the server is alive.
pub const IDLE_PAYLOAD_LENGTHS: [usize; 2] = [5, 10];

/// Payload lengths that precede a stuck client upload.
pub const UPLOAD_PAYLOAD_LENGTHS: [usize; 2] = [25, 37];

/// IPv4 (20) plus UDP (8) header bytes, added to payload sizes for byte counters.
pub const IP_UDP_HEADER_LEN: usize = 28;

pub const UDP_HEADER_LEN: usize = 8;

/// Leading bytes of a game datagram body.
pub const PACKET_MARKER: [u8; 2] = [254, 254];

/// Command byte telling the server to close its upload to the client.
pub const CLOSE_UPLOAD_COMMAND: u8 = 6;

pub fn is_idle_payload(len: usize) -> bool {
    IDLE_PAYLOAD_LENGTHS.contains(&len)
}

pub fn is_upload_payload(len: usize) -> bool {
    UPLOAD_PAYLOAD_LENGTHS.contains(&len)
}

/// Current wall clock as a capture timestamp
pub fn timestamp_now() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
}

/// Identifies one client/server UDP association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub client_addr: Ipv4Addr,
    pub client_port: u16,
    pub server_addr: Ipv4Addr,
    pub server_port: u16,
}

impl FlowKey {
    pub fn new(client_addr: Ipv4Addr, client_port: u16, server_addr: Ipv4Addr, server_port: u16) -> Self {
        Self {
            client_addr,
            client_port,
            server_addr,
            server_port,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}->{}:{}",
            self.client_addr, self.client_port, self.server_addr, self.server_port
        )
    }
}

/// A decoded UDP datagram as delivered by a capture source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub source: Ipv4Addr,
    pub source_port: u16,
    pub destination: Ipv4Addr,
    pub destination_port: u16,
    pub payload: Vec<u8>,
    pub captured_at: Timestamp,
}

impl Datagram {
    /// Formats the datagram as one packet dump line (without newline).
    ///
    /// Layout: `secs|src:port|dst:port|len|hex`
    pub fn to_dump_line(&self) -> String {
        format!(
            "{:.6}|{}:{}|{}:{}|{}|{}",
            self.captured_at.as_secs_f64(),
            self.source,
            self.source_port,
            self.destination,
            self.destination_port,
            self.payload.len(),
            hex::encode(&self.payload)
        )
    }

    /// Parses a line written by [`Datagram::to_dump_line`].
    pub fn from_dump_line(line: &str) -> Option<Self> {
        let mut fields = line.trim_end().split('|');
        let secs: f64 = fields.next()?.parse().ok()?;
        let captured_at = Duration::try_from_secs_f64(secs).ok()?;
        let (source, source_port) = parse_endpoint(fields.next()?)?;
        let (destination, destination_port) = parse_endpoint(fields.next()?)?;
        let len: usize = fields.next()?.parse().ok()?;
        let payload = hex::decode(fields.next()?).ok()?;
        if fields.next().is_some() || payload.len() != len {
            return None;
        }

        Some(Self {
            source,
            source_port,
            destination,
            destination_port,
            payload,
            captured_at,
        })
    }
}

fn parse_endpoint(field: &str) -> Option<(Ipv4Addr, u16)> {
    let (addr, port) = field.rsplit_once(':')?;
    Some((addr.parse().ok()?, port.parse().ok()?))
}
