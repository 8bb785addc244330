//! Registry of all observed connections
//!
//! Connections are created the first time a flow is seen and evicted by a
//! periodic sweep once they went quiet. A single lock guards the map: the
//! dispatch path holds it only to fetch or create a connection, the sweep
//! holds it for the whole pass so lookups never see a half-evicted map.
//!
//! Each connection sits behind its own mutex. Locks are always taken
//! registry first, connection second. The sweep never waits for a connection
//! lock: a connection held by the dispatch path is in use, so it stays.

use crate::connection::{Connection, ConnectionPolicy};
use crate::disconnect::DatagramSender;
use crate::metrics::MetricEvent;
use crate::recovery::GameRecoveryController;
use log::{debug, info};
use shared::{timestamp_now, FlowKey, Timestamp};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

pub type SharedConnection = Arc<Mutex<Connection>>;

/// Map of flows to their connections, shared by dispatch and cleanup
pub struct ConnectionRegister {
    connections: Mutex<HashMap<FlowKey, SharedConnection>>,
    policy: ConnectionPolicy,
    sender: Arc<dyn DatagramSender>,
}

impl ConnectionRegister {
    /// Creates an empty register. New connections get `policy` and send
    /// their disconnects through `sender`.
    pub fn new(policy: ConnectionPolicy, sender: Arc<dyn DatagramSender>) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            policy,
            sender,
        }
    }

    /// Returns the connection for `key`, creating it if this flow is new
    pub async fn get_or_create(
        &self,
        key: FlowKey,
        now: Timestamp,
        game: &Arc<GameRecoveryController>,
    ) -> SharedConnection {
        let mut connections = self.connections.lock().await;
        let connection = connections.entry(key).or_insert_with(|| {
            game.record(MetricEvent::ConnectionCreated);
            Arc::new(Mutex::new(Connection::new(
                key,
                now,
                Arc::clone(game),
                Arc::clone(&self.sender),
                self.policy,
            )))
        });
        Arc::clone(connection)
    }

    /// Removes every connection that is inactive at `now`.
    ///
    /// Connections currently locked by the dispatch path are skipped until the
    /// next pass. Returns the keys of the evicted connections.
    pub async fn sweep(&self, now: Timestamp) -> Vec<FlowKey> {
        let mut connections = self.connections.lock().await;
        debug!("Starting cleanup for {} connections.", connections.len());

        let mut evicted = Vec::new();
        for (key, connection) in connections.iter() {
            let Ok(connection) = connection.try_lock() else {
                debug!("Skipping busy connection {}", key);
                continue;
            };
            debug!("{:?}", *connection);
            if !connection.is_active(now) {
                connection.game().record(MetricEvent::ConnectionEvicted);
                evicted.push(*key);
            }
        }

        for key in &evicted {
            connections.remove(key);
        }
        evicted
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.lock().await.is_empty()
    }

    /// Spawns the periodic eviction cycle, sweeping against the wall clock
    pub fn spawn_cleanup(self: Arc<Self>, interval: Duration) -> CleanupTask {
        let register = self;
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = register.sweep(timestamp_now()).await;
                        if !evicted.is_empty() {
                            debug!("Evicted {} inactive connections", evicted.len());
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Connection cleanup stopped");
        });

        debug!("Starting cleanup task");
        CleanupTask {
            shutdown: shutdown_tx,
            handle,
        }
    }
}

/// Handle to the running eviction cycle
pub struct CleanupTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl CleanupTask {
    /// Stops the cycle and waits for the task to finish
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_game, RecordingSender};
    use std::net::Ipv4Addr;

    const T0: u64 = 1_700_000_000;

    fn secs(s: u64) -> Timestamp {
        Duration::from_secs(s)
    }

    fn key(client_port: u16) -> FlowKey {
        FlowKey::new(
            Ipv4Addr::new(192, 168, 1, 50),
            client_port,
            Ipv4Addr::new(10, 0, 0, 1),
            2056,
        )
    }

    fn register() -> Arc<ConnectionRegister> {
        Arc::new(ConnectionRegister::new(
            ConnectionPolicy::default(),
            Arc::new(RecordingSender::default()),
        ))
    }

    #[tokio::test]
    async fn test_get_or_create_reuses_connection() {
        let register = register();
        let (game, metrics, _) = test_game(2056);

        let first = register.get_or_create(key(5000), secs(T0), &game).await;
        let second = register.get_or_create(key(5000), secs(T0 + 1), &game).await;
        let other = register.get_or_create(key(5001), secs(T0 + 1), &game).await;

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(register.len().await, 2);
        assert_eq!(metrics.count(MetricEvent::ConnectionCreated), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_get_or_create_creates_once() {
        let register = register();
        let (game, metrics, _) = test_game(2056);

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let register = Arc::clone(&register);
            let game = Arc::clone(&game);
            tasks.push(tokio::spawn(async move {
                register.get_or_create(key(5000), secs(T0), &game).await
            }));
        }

        let mut connections = Vec::new();
        for task in tasks {
            connections.push(task.await.unwrap());
        }

        assert!(connections.iter().all(|c| Arc::ptr_eq(c, &connections[0])));
        assert_eq!(register.len().await, 1);
        assert_eq!(metrics.count(MetricEvent::ConnectionCreated), 1);
    }

    #[tokio::test]
    async fn test_sweep_evicts_only_inactive() {
        let register = register();
        let (game, metrics, _) = test_game(2056);

        let stale = register.get_or_create(key(5000), secs(T0), &game).await;
        let fresh = register.get_or_create(key(5001), secs(T0), &game).await;
        stale.lock().await.handle_client_to_server(&[0u8; 12], secs(T0 + 10));
        fresh.lock().await.handle_server_to_client(&[0u8; 5], secs(T0 + 200));

        let evicted = register.sweep(secs(T0 + 310)).await;

        assert_eq!(evicted, vec![key(5000)]);
        assert_eq!(register.len().await, 1);
        assert_eq!(metrics.count(MetricEvent::ConnectionEvicted), 1);

        // A new packet for an evicted flow starts a fresh connection
        let again = register.get_or_create(key(5000), secs(T0 + 311), &game).await;
        assert!(!Arc::ptr_eq(&again, &stale));
        assert_eq!(metrics.count(MetricEvent::ConnectionCreated), 3);
    }

    #[tokio::test]
    async fn test_sweep_boundary() {
        let register = register();
        let (game, _, _) = test_game(2056);
        register.get_or_create(key(5000), secs(T0), &game).await;

        assert!(register.sweep(secs(T0 + 299)).await.is_empty());
        assert_eq!(register.sweep(secs(T0 + 300)).await, vec![key(5000)]);
        assert!(register.is_empty().await);
    }

    #[tokio::test]
    async fn test_sweep_skips_locked_connection() {
        let register = register();
        let (game, metrics, _) = test_game(2056);
        let stale = register.get_or_create(key(5000), secs(T0), &game).await;

        let guard = stale.lock().await;
        let evicted = tokio::time::timeout(
            Duration::from_millis(100),
            register.sweep(secs(T0 + 1000)),
        )
        .await
        .expect("sweep waited for a locked connection");
        assert!(evicted.is_empty());
        assert_eq!(register.len().await, 1);
        drop(guard);

        assert_eq!(register.sweep(secs(T0 + 1000)).await, vec![key(5000)]);
        assert_eq!(metrics.count(MetricEvent::ConnectionEvicted), 1);
    }

    #[tokio::test]
    async fn test_cleanup_task_runs_and_stops() {
        let register = register();
        let (game, _, _) = test_game(2056);
        // Far in the past, so the wall clock sweep evicts it
        register.get_or_create(key(5000), secs(1_000), &game).await;

        let cleanup = Arc::clone(&register).spawn_cleanup(Duration::from_millis(20));
        for _ in 0..100 {
            if register.is_empty().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(register.is_empty().await);

        cleanup.stop().await;
    }
}
