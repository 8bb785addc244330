//! Routing of captured datagrams to their connections
//!
//! The connection lock is held only while its state is updated. A forced
//! disconnect decided under that lock is sent afterwards on the blocking pool,
//! so a slow raw socket stalls neither the dispatch loop nor the sweep.

use crate::capture::PacketDump;
use crate::connection_register::ConnectionRegister;
use crate::recovery::GameRecoveryController;
use log::{error, warn};
use shared::{Datagram, FlowKey};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ServerToClient,
    ClientToServer,
}

/// Outcome of dispatching one datagram
#[derive(Debug)]
pub struct Dispatched {
    pub direction: Direction,
    /// Forced disconnect triggered by this datagram, still being sent
    pub disconnect: Option<JoinHandle<()>>,
}

impl Dispatched {
    /// Waits until a disconnect started by this datagram has been sent
    pub async fn finish(self) -> Direction {
        if let Some(disconnect) = self.disconnect {
            if let Err(e) = disconnect.await {
                error!("Disconnect task failed: {}", e);
            }
        }
        self.direction
    }
}

pub struct Dispatcher {
    server_addr: Ipv4Addr,
    games: HashMap<u16, Arc<GameRecoveryController>>,
    register: Arc<ConnectionRegister>,
    dump: Option<PacketDump>,
}

impl Dispatcher {
    /// Creates a dispatcher for traffic of `server_addr`, keyed by the port of
    /// each game.
    pub fn new(
        server_addr: Ipv4Addr,
        games: impl IntoIterator<Item = Arc<GameRecoveryController>>,
        register: Arc<ConnectionRegister>,
    ) -> Self {
        Self {
            server_addr,
            games: games.into_iter().map(|game| (game.port(), game)).collect(),
            register,
            dump: None,
        }
    }

    /// Also appends every captured datagram to `dump`, monitored or not
    pub fn with_dump(mut self, dump: PacketDump) -> Self {
        self.dump = Some(dump);
        self
    }

    pub fn register(&self) -> &Arc<ConnectionRegister> {
        &self.register
    }

    pub fn game(&self, port: u16) -> Option<&Arc<GameRecoveryController>> {
        self.games.get(&port)
    }

    /// Orients a datagram relative to the configured server address
    pub fn route(&self, datagram: &Datagram) -> Option<(FlowKey, Direction)> {
        if datagram.source == self.server_addr {
            let key = FlowKey::new(
                datagram.destination,
                datagram.destination_port,
                datagram.source,
                datagram.source_port,
            );
            Some((key, Direction::ServerToClient))
        } else if datagram.destination == self.server_addr {
            let key = FlowKey::new(
                datagram.source,
                datagram.source_port,
                datagram.destination,
                datagram.destination_port,
            );
            Some((key, Direction::ClientToServer))
        } else {
            None
        }
    }

    /// Hands one datagram to its connection, returning the direction it was
    /// routed in. Unrelated traffic is logged and dropped.
    pub async fn dispatch(&self, datagram: &Datagram) -> Option<Dispatched> {
        if let Some(dump) = &self.dump {
            dump.write(datagram);
        }

        let Some((key, direction)) = self.route(datagram) else {
            warn!(
                "Ignoring datagram {}:{} -> {}:{}, server address not involved",
                datagram.source, datagram.source_port, datagram.destination, datagram.destination_port
            );
            return None;
        };

        let Some(game) = self.games.get(&key.server_port) else {
            warn!("Ignoring datagram for unmonitored flow {}", key);
            return None;
        };
        game.observe(datagram.captured_at);

        // The register lock is released before the connection is locked
        let connection = self
            .register
            .get_or_create(key, datagram.captured_at, game)
            .await;

        let pending = {
            let mut connection = connection.lock().await;
            match direction {
                Direction::ServerToClient => {
                    connection.handle_server_to_client(&datagram.payload, datagram.captured_at)
                }
                Direction::ClientToServer => {
                    connection.handle_client_to_server(&datagram.payload, datagram.captured_at);
                    None
                }
            }
        };

        let disconnect = pending.map(|pending| {
            tokio::task::spawn_blocking(move || {
                // Failures are logged by the send itself
                let _ = pending.send();
            })
        });
        Some(Dispatched {
            direction,
            disconnect,
        })
    }
}
