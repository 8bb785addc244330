//! Per-game escalation of revive strategies
//!
//! A [`GameRecoveryController`] exists for every monitored game server. The
//! connections of that server report whether it answered (`network_reply`) or
//! stayed silent (`no_network_reply`). Silence walks the controller through an
//! explicit transition table, one step per cooldown window; any reply resets it.

use crate::metrics::{MetricEvent, MetricsSink};
use crate::remediation::{RemediationAction, Remediator};
use log::{debug, info};
use shared::Timestamp;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

pub const DEFAULT_ESCALATION_COOLDOWN: Duration = Duration::from_secs(30);

/// Escalation level of a game that stopped answering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReviveStrategy {
    #[default]
    None,
    PopupConfirm,
    RestartCurrentSave,
    RestartPreviousSave,
    Stop,
}

impl ReviveStrategy {
    /// Transition table: the next level and the action that enters it.
    ///
    /// `Stop` is terminal and yields `None`.
    pub fn escalation(self) -> Option<(ReviveStrategy, RemediationAction)> {
        match self {
            ReviveStrategy::None => Some((
                ReviveStrategy::PopupConfirm,
                RemediationAction::DismissPopup,
            )),
            ReviveStrategy::PopupConfirm => Some((
                ReviveStrategy::RestartCurrentSave,
                RemediationAction::RestartCurrentSave,
            )),
            ReviveStrategy::RestartCurrentSave => Some((
                ReviveStrategy::RestartPreviousSave,
                RemediationAction::RestartPreviousSave,
            )),
            ReviveStrategy::RestartPreviousSave => {
                Some((ReviveStrategy::Stop, RemediationAction::Stop))
            }
            ReviveStrategy::Stop => None,
        }
    }

    /// Metric label of the strategy
    pub fn label(self) -> &'static str {
        match self {
            ReviveStrategy::None => "none",
            ReviveStrategy::PopupConfirm => "popup_confirm",
            ReviveStrategy::RestartCurrentSave => "restart_current_save",
            ReviveStrategy::RestartPreviousSave => "restart_old_save",
            ReviveStrategy::Stop => "stop",
        }
    }
}

impl fmt::Display for ReviveStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Default)]
struct EscalationState {
    strategy: ReviveStrategy,
    /// Start of the current cooldown. Unset until the game is first observed.
    changed_at: Option<Timestamp>,
}

/// Escalation state machine for one monitored game server
pub struct GameRecoveryController {
    game_id: String,
    port: u16,
    cooldown: Duration,
    state: Mutex<EscalationState>,
    metrics: Arc<dyn MetricsSink>,
    remediator: Arc<dyn Remediator>,
}

impl GameRecoveryController {
    pub fn new(
        game_id: impl Into<String>,
        port: u16,
        cooldown: Duration,
        metrics: Arc<dyn MetricsSink>,
        remediator: Arc<dyn Remediator>,
    ) -> Self {
        let game_id = game_id.into();
        info!("Setup ServerStatus game_id: {} port: {}", game_id, port);
        Self {
            game_id,
            port,
            cooldown,
            state: Mutex::new(EscalationState::default()),
            metrics,
            remediator,
        }
    }

    pub fn game_id(&self) -> &str {
        &self.game_id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn strategy(&self) -> ReviveStrategy {
        self.lock_state().strategy
    }

    /// Reports an event for this game to the metrics sink
    pub fn record(&self, event: MetricEvent) {
        self.metrics.record(&self.game_id, event);
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, EscalationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Traffic of this game was captured at `now`.
    ///
    /// The first observation starts the cooldown, so a watchdog that comes up
    /// next to a frozen game waits one full cooldown before its first action.
    pub fn observe(&self, now: Timestamp) {
        let mut state = self.lock_state();
        if state.changed_at.is_none() {
            debug!("Game {} first observed at {:.3}", self.game_id, now.as_secs_f64());
            state.changed_at = Some(now);
        }
    }

    /// The server sent substantive traffic: treat it as recovered.
    pub fn network_reply(&self, now: Timestamp) {
        let mut state = self.lock_state();
        if state.strategy != ReviveStrategy::None {
            info!(
                "Server of game {} is online again. Reset strategies.",
                self.game_id
            );
            state.strategy = ReviveStrategy::None;
            state.changed_at = Some(now);
        }
    }

    /// The server stayed silent while clients were talking to it.
    ///
    /// Advances one level if the cooldown since the last change has elapsed and
    /// returns the new strategy. Returns `None` when the call was absorbed by
    /// the cooldown or the terminal `Stop` level.
    pub fn no_network_reply(&self, now: Timestamp) -> Option<ReviveStrategy> {
        let (next, action) = {
            let mut state = self.lock_state();
            let changed_at = *state.changed_at.get_or_insert(now);
            if now.saturating_sub(changed_at) < self.cooldown {
                return None;
            }

            let Some((next, action)) = state.strategy.escalation() else {
                debug!(
                    "Game {} already stopped, waiting for manual recovery",
                    self.game_id
                );
                return None;
            };
            state.strategy = next;
            state.changed_at = Some(now);
            (next, action)
        };

        info!("{} (game {})", action.describe(), self.game_id);
        self.remediator.remediate(&self.game_id, action);
        self.record(MetricEvent::ReviveAttempted(next));
        Some(next)
    }
}

impl fmt::Debug for GameRecoveryController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GameRecoveryController")
            .field("game_id", &self.game_id)
            .field("port", &self.port)
            .field("strategy", &self.strategy())
            .finish()
    }
}
