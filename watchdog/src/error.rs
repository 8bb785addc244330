//! Error types for startup configuration, raw sends and packet capture

use std::fmt;

#[derive(Debug)]
pub enum ConfigError {
    IoError(std::io::Error),
    TomlError(String),
    InvalidGameTarget(String),
    MissingPort(String),
    InvalidAddress(String),
    MissingSetting(&'static str),
    NoGames,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::TomlError(e) => write!(f, "TOML parsing error: {}", e),
            ConfigError::InvalidGameTarget(e) => write!(f, "Invalid game target: {}", e),
            ConfigError::MissingPort(e) => write!(f, "No game port found: {}", e),
            ConfigError::InvalidAddress(e) => write!(f, "Invalid address: {}", e),
            ConfigError::MissingSetting(e) => write!(f, "Missing setting: {}", e),
            ConfigError::NoGames => write!(f, "At least one game must be monitored"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::IoError(err)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::TomlError(err.to_string())
    }
}

/// Failure to put a spoofed datagram on the wire
#[derive(Debug)]
pub enum SendError {
    SocketUnavailable(std::io::Error),
    BuildFailed(String),
    MalformedTrigger { len: usize },
    IoError(std::io::Error),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::SocketUnavailable(e) => write!(f, "Raw socket could not be created: {}", e),
            SendError::BuildFailed(e) => write!(f, "Datagram could not be built: {}", e),
            SendError::MalformedTrigger { len } => {
                write!(f, "Trigger payload too short for a disconnect body ({} bytes)", len)
            }
            SendError::IoError(e) => write!(f, "Raw send failed: {}", e),
        }
    }
}

impl std::error::Error for SendError {}

impl From<std::io::Error> for SendError {
    fn from(err: std::io::Error) -> Self {
        SendError::IoError(err)
    }
}

#[derive(Debug)]
pub enum CaptureError {
    IoError(std::io::Error),
    Unsupported(&'static str),
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::IoError(e) => write!(f, "Capture IO error: {}", e),
            CaptureError::Unsupported(e) => write!(f, "Capture not supported: {}", e),
        }
    }
}

impl std::error::Error for CaptureError {}

impl From<std::io::Error> for CaptureError {
    fn from(err: std::io::Error) -> Self {
        CaptureError::IoError(err)
    }
}
