//! Runtime configuration
//!
//! Values come from three layers, highest precedence first: command-line
//! arguments, an optional TOML file given with `--config`, and built-in
//! defaults. [`WatchdogConfig::resolve`] merges them and validates the result.
//!
//! A monitored game is given as `PATH[:PORT]`, where `PATH` is the game's
//! altroot directory. Without an explicit port it is read from
//! `CivilizationIV.ini` inside that directory.

use crate::capture::CaptureSource;
use crate::connection::{
    ConnectionPolicy, DEFAULT_ACTIVITY_TIMEOUT, DEFAULT_MIN_DISCONNECT_INTERVAL,
    DEFAULT_PACKET_LIMIT, DEFAULT_REPLY_WINDOW, DEFAULT_SILENCE_THRESHOLD,
};
use crate::connection_register::DEFAULT_CLEANUP_INTERVAL;
use crate::error::ConfigError;
use crate::recovery::DEFAULT_ESCALATION_COOLDOWN;
use clap::{ArgAction, Parser};
use log::warn;
use serde::Deserialize;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const GAME_INI_FILE: &str = "CivilizationIV.ini";
pub const DEFAULT_METRICS_PORT: u16 = 9146;

/// Watches Pitboss game traffic, disconnects stuck uploads and revives frozen games
#[derive(Parser, Debug, Default, Clone)]
#[command(name = "civpb-watchdog", author, version, about)]
pub struct Args {
    /// The interface to listen to, e.g., eth0
    #[arg(long, value_name = "INTERFACE")]
    pub interface: Option<String>,

    /// The IP address used for the PB server
    #[arg(long, value_name = "IP")]
    pub address: Option<Ipv4Addr>,

    /// Altroot directory of a Pitboss game, syntax: PATH[:PORT].
    /// If the port is omitted it is read from CivilizationIV.ini.
    #[arg(short = 'g', long = "games", value_name = "GAME")]
    pub games: Vec<String>,

    /// Number of stray packets after which the client is disconnected
    #[arg(short = 'c', long, value_name = "COUNT")]
    pub packet_limit: Option<u32>,

    /// Directory containing the civpb-confirm-popup and civpb-kill scripts
    #[arg(long, value_name = "DIR")]
    pub script_path: Option<PathBuf>,

    /// Serve prometheus metrics at ADDR[:PORT]
    #[arg(long, value_name = "ADDR")]
    pub prometheus: Option<String>,

    /// Append every observed datagram to this file
    #[arg(long, value_name = "FILE")]
    pub dump_packets: Option<PathBuf>,

    /// Replay a packet dump instead of capturing live traffic
    #[arg(long, value_name = "FILE")]
    pub replay: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

/// Contents of the optional TOML configuration file
#[derive(Debug, Default, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub interface: Option<String>,
    pub address: Option<Ipv4Addr>,
    pub games: Vec<String>,
    pub packet_limit: Option<u32>,
    pub script_path: Option<PathBuf>,
    pub prometheus: Option<String>,
    pub dump_packets: Option<PathBuf>,
    pub activity_timeout_secs: Option<u64>,
    pub cleanup_interval_secs: Option<u64>,
    pub escalation_cooldown_secs: Option<u64>,
    pub reply_window_secs: Option<u64>,
    pub silence_threshold_secs: Option<u64>,
    pub min_disconnect_interval_ms: Option<u64>,
}

impl FileConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }
}

/// A monitored game server instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameTarget {
    /// Directory name of the altroot, used as the game identity
    pub id: String,
    pub path: PathBuf,
    pub port: u16,
}

impl GameTarget {
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let (path, port) = match text.rsplit_once(':') {
            Some((path, port)) => {
                let port: u16 = port.trim().parse().map_err(|_| {
                    ConfigError::InvalidGameTarget(format!("bad port in '{}'", text))
                })?;
                (PathBuf::from(path), port)
            }
            None => {
                let path = PathBuf::from(text);
                let port = port_from_ini(&path)?;
                (path, port)
            }
        };

        if port == 0 {
            return Err(ConfigError::InvalidGameTarget(format!(
                "game port must be positive in '{}'",
                text
            )));
        }

        let resolved = fs::canonicalize(&path).unwrap_or_else(|_| path.clone());
        let id = resolved
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| ConfigError::InvalidGameTarget(format!("no directory name in '{}'", text)))?;

        Ok(Self { id, path, port })
    }
}

/// Reads `Port=` from the game's ini file
pub fn port_from_ini(altroot: &Path) -> Result<u16, ConfigError> {
    let ini_path = altroot.join(GAME_INI_FILE);
    let content = fs::read_to_string(&ini_path).map_err(|e| {
        warn!(
            "Could not read port from {}. Wrong altroot path?",
            ini_path.display()
        );
        ConfigError::MissingPort(format!("{}: {}", ini_path.display(), e))
    })?;

    content
        .lines()
        .find_map(|line| line.strip_prefix("Port="))
        .and_then(|port| port.trim().parse().ok())
        .ok_or_else(|| ConfigError::MissingPort(format!("no Port= line in {}", ini_path.display())))
}

/// Parses `ADDR[:PORT]` for the metrics endpoint
pub fn parse_metrics_addr(text: &str) -> Result<SocketAddr, ConfigError> {
    if let Ok(addr) = text.parse::<SocketAddr>() {
        return Ok(addr);
    }
    text.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, DEFAULT_METRICS_PORT))
        .map_err(|_| ConfigError::InvalidAddress(text.to_string()))
}

fn default_script_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Fully resolved configuration
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Where datagrams come from. A replay file wins over an interface.
    pub source: CaptureSource,
    pub address: Ipv4Addr,
    pub games: Vec<GameTarget>,
    pub script_path: PathBuf,
    pub prometheus: Option<SocketAddr>,
    pub dump_packets: Option<PathBuf>,
    pub policy: ConnectionPolicy,
    pub cleanup_interval: Duration,
    pub escalation_cooldown: Duration,
}

impl WatchdogConfig {
    /// Loads the file named by `--config`, if any, and merges it with `args`
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let file = match &args.config {
            Some(path) => FileConfig::from_file(path)?,
            None => FileConfig::default(),
        };
        Self::resolve(args, file)
    }

    pub fn resolve(args: &Args, file: FileConfig) -> Result<Self, ConfigError> {
        let address = args
            .address
            .or(file.address)
            .ok_or(ConfigError::MissingSetting("server address"))?;

        let game_targets = if args.games.is_empty() {
            file.games
        } else {
            args.games.clone()
        };
        if game_targets.is_empty() {
            return Err(ConfigError::NoGames);
        }
        let games = game_targets
            .iter()
            .map(|text| GameTarget::parse(text))
            .collect::<Result<Vec<_>, _>>()?;

        let source = match (args.replay.clone(), args.interface.clone().or(file.interface)) {
            (Some(path), interface) => {
                if let Some(interface) = interface {
                    warn!("Replaying {} instead of capturing on {}", path.display(), interface);
                }
                CaptureSource::Replay { path }
            }
            (None, Some(interface)) => CaptureSource::Live { interface },
            (None, None) => return Err(ConfigError::MissingSetting("interface or replay file")),
        };

        let prometheus = args
            .prometheus
            .clone()
            .or(file.prometheus)
            .filter(|text| !text.is_empty())
            .map(|text| parse_metrics_addr(&text))
            .transpose()?;

        let secs_or = |value: Option<u64>, default: Duration| {
            value.map(Duration::from_secs).unwrap_or(default)
        };
        let policy = ConnectionPolicy {
            packet_limit: args
                .packet_limit
                .or(file.packet_limit)
                .unwrap_or(DEFAULT_PACKET_LIMIT),
            activity_timeout: secs_or(file.activity_timeout_secs, DEFAULT_ACTIVITY_TIMEOUT),
            reply_window: secs_or(file.reply_window_secs, DEFAULT_REPLY_WINDOW),
            silence_threshold: secs_or(file.silence_threshold_secs, DEFAULT_SILENCE_THRESHOLD),
            min_disconnect_interval: file
                .min_disconnect_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_MIN_DISCONNECT_INTERVAL),
        };

        Ok(Self {
            source,
            address,
            games,
            script_path: args
                .script_path
                .clone()
                .or(file.script_path)
                .unwrap_or_else(default_script_path),
            prometheus,
            dump_packets: args.dump_packets.clone().or(file.dump_packets),
            policy,
            cleanup_interval: secs_or(file.cleanup_interval_secs, DEFAULT_CLEANUP_INTERVAL),
            escalation_cooldown: secs_or(file.escalation_cooldown_secs, DEFAULT_ESCALATION_COOLDOWN),
        })
    }

    /// Monitored server ports
    pub fn ports(&self) -> Vec<u16> {
        self.games.iter().map(|game| game.port).collect()
    }
}
