//! Capture sources feeding the dispatcher
//!
//! Datagrams reach the dispatch loop through a bounded channel, either from a
//! live packet socket bound to one interface or from a packet dump replayed
//! in file order. Both sources only forward traffic on monitored ports.

use crate::error::CaptureError;
use crate::metrics::MetricsSink;
use etherparse::{IpNumber, Ipv4HeaderSlice, UdpHeaderSlice};
use log::{debug, error, info, warn};
use shared::{timestamp_now, Datagram, Timestamp, UDP_HEADER_LEN};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const CAPTURE_RETRY_DELAY: Duration = Duration::from_secs(10);
pub const CAPTURE_QUEUE_SIZE: usize = 4096;

/// Read timeout of the live socket, bounds how long shutdown waits on it
const POLL_INTERVAL: Duration = Duration::from_secs(1);
const MAX_FRAME_LEN: usize = 65_536;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureSource {
    Live { interface: String },
    Replay { path: PathBuf },
}

/// Decodes an IPv4 packet carrying UDP.
///
/// Returns `None` for anything else, for truncated packets and for non-first
/// fragments.
pub fn decode_ipv4_udp(packet: &[u8], captured_at: Timestamp) -> Option<Datagram> {
    let ip = Ipv4HeaderSlice::from_slice(packet).ok()?;
    if ip.protocol() != IpNumber::UDP || ip.to_header().is_fragmenting_payload() {
        return None;
    }

    let ip_len = ip.slice().len();
    let total_len = usize::from(ip.total_len()).min(packet.len());
    let transport = packet.get(ip_len..total_len)?;

    let udp = UdpHeaderSlice::from_slice(transport).ok()?;
    let udp_len = usize::from(udp.length()).clamp(UDP_HEADER_LEN, transport.len());
    let payload = transport.get(UDP_HEADER_LEN..udp_len)?;

    Some(Datagram {
        source: ip.source_addr(),
        source_port: udp.source_port(),
        destination: ip.destination_addr(),
        destination_port: udp.destination_port(),
        payload: payload.to_vec(),
        captured_at,
    })
}

/// Port filter applied before datagrams enter the queue
#[derive(Debug, Clone)]
pub struct PortFilter {
    ports: HashSet<u16>,
}

impl PortFilter {
    pub fn new(ports: impl IntoIterator<Item = u16>) -> Self {
        Self {
            ports: ports.into_iter().collect(),
        }
    }

    pub fn matches(&self, datagram: &Datagram) -> bool {
        self.ports.contains(&datagram.source_port) || self.ports.contains(&datagram.destination_port)
    }
}

/// Starts the producer for `source`. The task ends when the source is
/// exhausted or the receiving side of `queue` is dropped.
pub fn spawn_capture(
    source: CaptureSource,
    filter: PortFilter,
    metrics: Arc<dyn MetricsSink>,
    queue: mpsc::Sender<Datagram>,
) -> JoinHandle<()> {
    match source {
        CaptureSource::Live { interface } => tokio::task::spawn_blocking(move || {
            live_capture(&interface, &filter, metrics.as_ref(), &queue)
        }),
        CaptureSource::Replay { path } => tokio::spawn(async move {
            match replay(&path, &filter, &queue).await {
                Ok(count) => info!("Replayed {} datagrams from {}", count, path.display()),
                Err(e) => error!("Failed to replay {}: {}", path.display(), e),
            }
        }),
    }
}

/// Feeds the datagrams of a packet dump into `queue`, returning how many were sent
pub async fn replay(
    path: &Path,
    filter: &PortFilter,
    queue: &mpsc::Sender<Datagram>,
) -> Result<usize, CaptureError> {
    let file = tokio::fs::File::open(path).await?;
    let mut lines = BufReader::new(file).lines();
    let mut count = 0;

    while let Some(line) = lines.next_line().await? {
        let Some(datagram) = Datagram::from_dump_line(&line) else {
            debug!("Skipping dump line: {}", line);
            continue;
        };
        if !filter.matches(&datagram) {
            continue;
        }
        if queue.send(datagram).await.is_err() {
            break;
        }
        count += 1;
    }
    Ok(count)
}

/// Restarts the capture after every failure until the queue closes
fn live_capture(
    interface: &str,
    filter: &PortFilter,
    metrics: &dyn MetricsSink,
    queue: &mpsc::Sender<Datagram>,
) {
    info!("Starting capture on {}", interface);
    while !queue.is_closed() {
        match capture_until_error(interface, filter, queue) {
            Ok(()) => break,
            Err(e) => {
                error!("Capture on {} failed: {}", interface, e);
                metrics.capture_error();
                wait_for_retry(queue);
            }
        }
    }
    info!("Capture on {} stopped", interface);
}

fn wait_for_retry(queue: &mpsc::Sender<Datagram>) {
    let mut waited = Duration::ZERO;
    while waited < CAPTURE_RETRY_DELAY && !queue.is_closed() {
        std::thread::sleep(POLL_INTERVAL);
        waited += POLL_INTERVAL;
    }
}

#[cfg(target_os = "linux")]
fn capture_until_error(
    interface: &str,
    filter: &PortFilter,
    queue: &mpsc::Sender<Datagram>,
) -> Result<(), CaptureError> {
    use socket2::{Domain, Protocol, Socket, Type};
    use std::io::Read;

    const ETH_P_IP: u16 = 0x0800;

    // Link-layer headers are stripped by SOCK_DGRAM, frames start at the IP header
    let socket = Socket::new(
        Domain::PACKET,
        Type::DGRAM,
        Some(Protocol::from(i32::from(ETH_P_IP.to_be()))),
    )?;
    socket.bind_device(Some(interface.as_bytes()))?;
    socket.set_read_timeout(Some(POLL_INTERVAL))?;
    let mut socket = socket;

    let mut frame = vec![0u8; MAX_FRAME_LEN];
    loop {
        let len = match socket.read(&mut frame) {
            Ok(len) => len,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                if queue.is_closed() {
                    return Ok(());
                }
                continue;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };

        let Some(datagram) = decode_ipv4_udp(&frame[..len], timestamp_now()) else {
            continue;
        };
        if !filter.matches(&datagram) {
            continue;
        }
        if queue.blocking_send(datagram).is_err() {
            return Ok(());
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn capture_until_error(
    _interface: &str,
    _filter: &PortFilter,
    _queue: &mpsc::Sender<Datagram>,
) -> Result<(), CaptureError> {
    Err(CaptureError::Unsupported("live capture needs AF_PACKET"))
}

/// Appends every dispatched datagram to a dump file.
///
/// The handle only queues datagrams. A blocking task owns the file, so the
/// dispatch loop never waits on disk writes.
#[derive(Clone)]
pub struct PacketDump {
    queue: mpsc::UnboundedSender<Datagram>,
}

impl PacketDump {
    /// Opens `path` for appending, writes the header line and starts the
    /// writer task. The task ends once every handle is dropped and the queued
    /// datagrams are written.
    pub fn create(path: &Path) -> io::Result<(Self, JoinHandle<()>)> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = BufWriter::new(file);
        writeln!(
            writer,
            "starting packet dump at {:.6}",
            timestamp_now().as_secs_f64()
        )?;
        writer.flush()?;
        info!("Dumping packets to {}", path.display());

        let (queue, pending) = mpsc::unbounded_channel();
        let task = tokio::task::spawn_blocking(move || write_dump(writer, pending));
        Ok((Self { queue }, task))
    }

    pub fn write(&self, datagram: &Datagram) {
        if self.queue.send(datagram.clone()).is_err() {
            warn!("Packet dump writer stopped, dropping datagram");
        }
    }
}

/// Writes queued datagrams, flushing whenever the queue runs dry
fn write_dump(mut writer: BufWriter<File>, mut pending: mpsc::UnboundedReceiver<Datagram>) {
    while let Some(first) = pending.blocking_recv() {
        let mut next = Some(first);
        while let Some(datagram) = next {
            if let Err(e) = writeln!(writer, "{}", datagram.to_dump_line()) {
                warn!("Failed to write packet dump: {}", e);
            }
            next = pending.try_recv().ok();
        }
        if let Err(e) = writer.flush() {
            warn!("Failed to flush packet dump: {}", e);
        }
    }
    debug!("Packet dump closed");
}
