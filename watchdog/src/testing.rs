//! Recording collaborators for unit tests

use crate::disconnect::DatagramSender;
use crate::error::SendError;
use crate::metrics::{MetricEvent, MetricsSink};
use crate::recovery::{GameRecoveryController, DEFAULT_ESCALATION_COOLDOWN};
use crate::remediation::{RemediationAction, Remediator};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
pub struct RecordingMetrics {
    events: Mutex<Vec<(String, MetricEvent)>>,
}

impl RecordingMetrics {
    pub fn count(&self, event: MetricEvent) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, e)| *e == event)
            .count()
    }
}

impl MetricsSink for RecordingMetrics {
    fn record(&self, game: &str, event: MetricEvent) {
        self.events.lock().unwrap().push((game.to_string(), event));
    }
}

#[derive(Default)]
pub struct RecordingRemediator {
    actions: Mutex<Vec<(String, RemediationAction)>>,
}

impl RecordingRemediator {
    pub fn actions(&self) -> Vec<(String, RemediationAction)> {
        self.actions.lock().unwrap().clone()
    }
}

impl Remediator for RecordingRemediator {
    fn remediate(&self, game_id: &str, action: RemediationAction) {
        self.actions
            .lock()
            .unwrap()
            .push((game_id.to_string(), action));
    }
}

#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<(Vec<u8>, Ipv4Addr)>>,
    attempts: AtomicUsize,
    fail: AtomicBool,
    delay_ms: AtomicU64,
}

impl RecordingSender {
    pub fn sent(&self) -> Vec<(Vec<u8>, Ipv4Addr)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Makes every send block the calling thread, like a congested socket
    pub fn delay_sends(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

impl DatagramSender for RecordingSender {
    fn send(&self, datagram: &[u8], destination: Ipv4Addr) -> Result<(), SendError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(SendError::SocketUnavailable(std::io::Error::from(
                std::io::ErrorKind::PermissionDenied,
            )));
        }
        self.sent.lock().unwrap().push((datagram.to_vec(), destination));
        Ok(())
    }
}

/// A controller named `pb<port>` wired to recording collaborators
pub fn test_game(
    port: u16,
) -> (
    Arc<GameRecoveryController>,
    Arc<RecordingMetrics>,
    Arc<RecordingRemediator>,
) {
    let metrics = Arc::new(RecordingMetrics::default());
    let remediator = Arc::new(RecordingRemediator::default());
    let game = Arc::new(GameRecoveryController::new(
        format!("pb{}", port),
        port,
        DEFAULT_ESCALATION_COOLDOWN,
        metrics.clone(),
        remediator.clone(),
    ));
    (game, metrics, remediator)
}
