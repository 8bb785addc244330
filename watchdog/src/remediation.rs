//! External remediation actions
//!
//! The recovery controller decides *what* to do; a [`Remediator`] carries it
//! out. The production remediator queues requests to a single executor task
//! that launches the helper scripts one after another, so the dispatch path
//! never waits for a script.

use log::{error, info, warn};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const CONFIRM_POPUP_SCRIPT: &str = "civpb-confirm-popup";
pub const KILL_SCRIPT: &str = "civpb-kill";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemediationAction {
    DismissPopup,
    RestartCurrentSave,
    RestartPreviousSave,
    Stop,
}

impl RemediationAction {
    pub fn describe(self) -> &'static str {
        match self {
            RemediationAction::DismissPopup => "Simulate mouse click",
            RemediationAction::RestartCurrentSave => "Restart with current save",
            RemediationAction::RestartPreviousSave => "Restart with previous save",
            RemediationAction::Stop => {
                "All restart strategies failed. Kill game and wait for manual recovery"
            }
        }
    }

    /// Script name and arguments that perform the action for `game_id`
    pub fn command_line(self, game_id: &str) -> (&'static str, Vec<String>) {
        match self {
            RemediationAction::DismissPopup => (CONFIRM_POPUP_SCRIPT, vec![game_id.to_string()]),
            RemediationAction::RestartCurrentSave => (KILL_SCRIPT, vec![game_id.to_string()]),
            RemediationAction::RestartPreviousSave => {
                (KILL_SCRIPT, vec!["-p".to_string(), game_id.to_string()])
            }
            RemediationAction::Stop => (KILL_SCRIPT, vec!["-s".to_string(), game_id.to_string()]),
        }
    }
}

/// Fire-and-forget execution of remediation actions
pub trait Remediator: Send + Sync {
    fn remediate(&self, game_id: &str, action: RemediationAction);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemediationRequest {
    pub game_id: String,
    pub action: RemediationAction,
}

/// Queues requests for the script executor task
pub struct ScriptRemediator {
    queue: mpsc::UnboundedSender<RemediationRequest>,
}

impl ScriptRemediator {
    /// Creates the remediator and spawns the executor running scripts from `script_path`
    pub fn spawn(script_path: PathBuf) -> (Self, JoinHandle<()>) {
        let (queue, requests) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_scripts(script_path, requests));
        (Self { queue }, handle)
    }
}

impl Remediator for ScriptRemediator {
    fn remediate(&self, game_id: &str, action: RemediationAction) {
        let request = RemediationRequest {
            game_id: game_id.to_string(),
            action,
        };
        if let Err(e) = self.queue.send(request) {
            error!("Failed to queue remediation {:?}: executor stopped", e.0.action);
        }
    }
}

async fn run_scripts(script_path: PathBuf, mut requests: mpsc::UnboundedReceiver<RemediationRequest>) {
    while let Some(request) = requests.recv().await {
        run_script(&script_path, &request).await;
    }
}

async fn run_script(script_path: &Path, request: &RemediationRequest) {
    let (script, args) = request.action.command_line(&request.game_id);
    let program = script_path.join(script);

    match Command::new(&program).args(&args).status().await {
        Ok(status) if status.success() => {
            info!("{} {} finished", program.display(), args.join(" "));
        }
        Ok(status) => {
            warn!("{} {} exited with {}", program.display(), args.join(" "), status);
        }
        Err(e) => {
            error!("Failed to launch {}: {}", program.display(), e);
        }
    }
}
