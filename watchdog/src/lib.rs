//! # Pitboss Watchdog Library
//!
//! Watches the UDP traffic of Civilization IV Pitboss servers and steps in
//! when a game gets stuck. Two failure modes are handled:
//!
//! ### Stuck uploads
//! A client that stops answering while the server uploads a save to it can
//! block the whole game. When a connection accumulates too many unanswered
//! upload packets, the watchdog impersonates the client and sends the server
//! a "close upload" datagram through a raw socket.
//!
//! ### Frozen servers
//! If clients keep talking to a server that only answers with keepalives,
//! the game is assumed to hang on a popup or worse. The per-game recovery
//! controller escalates through remediation scripts: dismiss the popup,
//! restart from the current save, restart from the previous save, and finally
//! stop the game for manual recovery.
//!
//! ## Module Organization
//!
//! ### Core
//! - `connection`: per-flow tracking and the stuck-upload heuristic
//! - `connection_register`: concurrent store of connections with periodic eviction
//! - `recovery`: the escalation state machine of one game
//! - `disconnect`: builds and sends the spoofed close-upload datagram
//! - `dispatcher`: routes captured datagrams to their connections
//!
//! ### Adapters
//! - `capture`: live packet socket, dump replay and packet dump writer
//! - `remediation`: script execution for recovery actions
//! - `metrics`: metrics sink and Prometheus text endpoint
//! - `config`: command line and TOML configuration
//! - `network`: the runtime driving everything
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use clap::Parser;
//! use watchdog::config::{Args, WatchdogConfig};
//! use watchdog::network::Watchdog;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let args = Args::parse();
//!     let config = WatchdogConfig::from_args(&args)?;
//!
//!     // Captures on the configured interface until Ctrl+C
//!     Watchdog::new(config).run().await?;
//!     Ok(())
//! }
//! ```

pub mod capture;
pub mod config;
pub mod connection;
pub mod connection_register;
pub mod disconnect;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod network;
pub mod recovery;
pub mod remediation;

#[cfg(test)]
mod testing;
