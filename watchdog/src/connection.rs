//! Per-flow tracking of a client connected to a monitored game server
//!
//! A connection watches both directions of one client/server association:
//! - Server to client traffic counts as "unanswered" until the client sends
//!   something back. Substantive server packets prove the server is alive.
//! - Client to server traffic resets the unanswered count and is the moment
//!   we check whether the server has gone quiet.
//!
//! If the server piles up upload packets the client never acknowledges, the
//! connection forces the upload to end with a spoofed disconnect. The state
//! change happens under the connection lock; the send itself is handed back
//! as a [`PendingDisconnect`] so the caller can perform it after unlocking.

use crate::disconnect::{build_datagram, disconnect_body, DatagramSender};
use crate::error::SendError;
use crate::metrics::MetricEvent;
use crate::recovery::GameRecoveryController;
use log::{debug, error, info, warn};
use shared::{is_idle_payload, is_upload_payload, FlowKey, Timestamp, IP_UDP_HEADER_LEN};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_PACKET_LIMIT: u32 = 2000;
pub const DEFAULT_ACTIVITY_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_REPLY_WINDOW: Duration = Duration::from_secs(22);
pub const DEFAULT_SILENCE_THRESHOLD: Duration = Duration::from_secs(18);
pub const DEFAULT_MIN_DISCONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// Above this many unanswered packets a late client reply is worth a debug line
const UNANSWERED_LOG_THRESHOLD: u32 = 100;

/// Thresholds shared by all connections
///
/// The reply window and silence threshold are heuristics tuned against the
/// observed game traffic; a single client joining a blocked game sends at
/// most every 20 seconds, which the 22s window must cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionPolicy {
    /// Unanswered server packets before an upload is forcibly closed
    pub packet_limit: u32,
    pub activity_timeout: Duration,
    /// A client packet only counts as "recent activity" within this window
    pub reply_window: Duration,
    /// Server silence (ignoring keepalives) above this is a stall
    pub silence_threshold: Duration,
    /// Minimum time between two forced disconnects of the same connection
    pub min_disconnect_interval: Duration,
}

impl Default for ConnectionPolicy {
    fn default() -> Self {
        Self {
            packet_limit: DEFAULT_PACKET_LIMIT,
            activity_timeout: DEFAULT_ACTIVITY_TIMEOUT,
            reply_window: DEFAULT_REPLY_WINDOW,
            silence_threshold: DEFAULT_SILENCE_THRESHOLD,
            min_disconnect_interval: DEFAULT_MIN_DISCONNECT_INTERVAL,
        }
    }
}

/// State of one client/server flow
pub struct Connection {
    key: FlowKey,
    /// Controller of the game server this flow belongs to
    game: Arc<GameRecoveryController>,
    sender: Arc<dyn DatagramSender>,
    policy: ConnectionPolicy,

    /// Server packets since the last client packet, saturating at `u32::MAX`
    unanswered_outgoing: u32,
    /// Capture time of the last client to server packet
    last_incoming_at: Timestamp,
    /// Capture time of the last server to client packet
    last_outgoing_at: Timestamp,
    /// Like `last_outgoing_at`, but ignoring keepalive-sized payloads
    last_active_outgoing_at: Timestamp,
    /// When the last forced disconnect was attempted
    disconnected_at: Option<Timestamp>,
}

/// A forced disconnect decided under the connection lock, not yet sent
pub struct PendingDisconnect {
    key: FlowKey,
    datagram: Vec<u8>,
    game: Arc<GameRecoveryController>,
    sender: Arc<dyn DatagramSender>,
}

impl PendingDisconnect {
    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    /// Sends the spoofed datagram to the server.
    ///
    /// This may block on the raw socket, so it must not run while the
    /// connection or the register is locked. Only a successful send counts as
    /// a forced disconnect.
    pub fn send(self) -> Result<(), SendError> {
        // Looks like it is coming from the client
        let result = self.sender.send(&self.datagram, self.key.server_addr);
        match &result {
            Ok(()) => self.game.record(MetricEvent::ForcedDisconnect),
            Err(e) => error!("Disconnect of {} failed: {}", self.key, e),
        }
        result
    }
}

impl fmt::Debug for PendingDisconnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingDisconnect")
            .field("key", &self.key)
            .field("len", &self.datagram.len())
            .finish()
    }
}

impl Connection {
    /// Creates a connection first seen at `now`.
    ///
    /// All timestamps start at `now`, so a fresh connection is considered to
    /// have a live server and the first client packet cannot report silence.
    pub fn new(
        key: FlowKey,
        now: Timestamp,
        game: Arc<GameRecoveryController>,
        sender: Arc<dyn DatagramSender>,
        policy: ConnectionPolicy,
    ) -> Self {
        let connection = Self {
            key,
            game,
            sender,
            policy,
            unanswered_outgoing: 0,
            last_incoming_at: now,
            last_outgoing_at: now,
            last_active_outgoing_at: now,
            disconnected_at: None,
        };
        debug!("Detecting new connection {}", connection);
        connection
    }

    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    pub fn game(&self) -> &Arc<GameRecoveryController> {
        &self.game
    }

    pub fn unanswered_outgoing(&self) -> u32 {
        self.unanswered_outgoing
    }

    pub fn disconnected_at(&self) -> Option<Timestamp> {
        self.disconnected_at
    }

    /// Accounts for a server to client packet captured at `now`.
    ///
    /// Returns the disconnect to send when this packet is an upload packet that
    /// reaches the unanswered limit and the throttle allows another attempt.
    pub fn handle_server_to_client(
        &mut self,
        payload: &[u8],
        now: Timestamp,
    ) -> Option<PendingDisconnect> {
        self.unanswered_outgoing = self.unanswered_outgoing.saturating_add(1);
        self.last_outgoing_at = now;

        self.game
            .record(MetricEvent::PacketSent(payload.len() + IP_UDP_HEADER_LEN));

        // While the game hangs on a "save error" popup the server only sends
        // keepalives of these sizes, so they say nothing about server sanity.
        if !is_idle_payload(payload.len()) {
            self.last_active_outgoing_at = now;
            self.game.network_reply(now);
        }

        if !is_upload_payload(payload.len()) {
            return None;
        }

        if self.unanswered_outgoing < self.policy.packet_limit {
            return None;
        }

        self.disconnect(payload, now)
    }

    /// Accounts for a client to server packet captured at `now`.
    ///
    /// Reports server silence to the game before the client timestamps move,
    /// then clears the unanswered count.
    pub fn handle_client_to_server(&mut self, payload: &[u8], now: Timestamp) {
        self.game.record(MetricEvent::PacketReceived(payload.len()));

        if self.unanswered_outgoing > UNANSWERED_LOG_THRESHOLD {
            debug!(
                "Received client data at {} after {} server packets / {:.1} seconds.",
                self,
                self.unanswered_outgoing,
                now.saturating_sub(self.last_incoming_at).as_secs_f64()
            );
        }

        // Must compare against the previous client packet, before it is updated
        if self.server_silent(now) {
            debug!("{:?} - detected no network reply.", self);
            self.game.no_network_reply(now);
        }

        self.unanswered_outgoing = 0;
        self.last_incoming_at = now;
    }

    /// Recent client activity met with no substantive server traffic
    fn server_silent(&self, now: Timestamp) -> bool {
        now.saturating_sub(self.last_incoming_at) < self.policy.reply_window
            && now.saturating_sub(self.last_active_outgoing_at) > self.policy.silence_threshold
    }

    /// Decides to force the server to stop uploading to this client.
    ///
    /// The state is reset whether or not a datagram can be built, and later
    /// send failures do not undo it, so a burst of upload packets does not turn
    /// into a burst of attempts.
    fn disconnect(&mut self, payload: &[u8], now: Timestamp) -> Option<PendingDisconnect> {
        if let Some(last) = self.disconnected_at {
            if now.saturating_sub(last) < self.policy.min_disconnect_interval {
                debug!("{} - disconnect suppressed, last attempt too recent", self);
                return None;
            }
        }

        info!("Disconnecting client at {:?}", self);
        let pending = match self.build_disconnect(payload) {
            Ok(datagram) => Some(PendingDisconnect {
                key: self.key,
                datagram,
                game: Arc::clone(&self.game),
                sender: Arc::clone(&self.sender),
            }),
            Err(e @ SendError::MalformedTrigger { .. }) => {
                warn!("{} - {}", self, e);
                None
            }
            Err(e) => {
                error!("{} - {}", self, e);
                None
            }
        };

        self.disconnected_at = Some(now);
        self.unanswered_outgoing = 0;
        pending
    }

    fn build_disconnect(&self, payload: &[u8]) -> Result<Vec<u8>, SendError> {
        let body = disconnect_body(payload).ok_or(SendError::MalformedTrigger { len: payload.len() })?;
        build_datagram(&self.key, &body)
    }

    /// True while either direction saw traffic within the activity timeout
    pub fn is_active(&self, now: Timestamp) -> bool {
        let last_seen = self.last_incoming_at.max(self.last_outgoing_at);
        now.saturating_sub(last_seen) < self.policy.activity_timeout
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "connection[{}:{}->{}]",
            self.key.client_addr,
            self.key.client_port,
            self.game.game_id()
        )
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#p: {}, t_in: {:.3}, t_out: {:.3}",
            self,
            self.unanswered_outgoing,
            self.last_incoming_at.as_secs_f64(),
            self.last_outgoing_at.as_secs_f64()
        )?;
        if let Some(at) = self.disconnected_at {
            write!(f, ", disconnected: {:.3}", at.as_secs_f64())?;
        }
        Ok(())
    }
}
