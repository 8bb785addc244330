//! Watchdog runtime wiring capture, dispatch and background tasks together

use crate::capture::{spawn_capture, PacketDump, PortFilter, CAPTURE_QUEUE_SIZE};
use crate::config::WatchdogConfig;
use crate::connection_register::ConnectionRegister;
use crate::disconnect::{DatagramSender, RawSocketSender};
use crate::dispatcher::Dispatcher;
use crate::metrics::{serve_metrics, CounterRegistry, MetricsSink};
use crate::recovery::GameRecoveryController;
use crate::remediation::{Remediator, ScriptRemediator};
use log::{error, info};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Main watchdog coordinating capture, dispatch and remediation
pub struct Watchdog {
    config: WatchdogConfig,
}

impl Watchdog {
    pub fn new(config: WatchdogConfig) -> Self {
        Self { config }
    }

    /// Runs until the capture source is exhausted or Ctrl+C arrives
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let config = &self.config;
        let registry = Arc::new(CounterRegistry::new());
        let metrics: Arc<dyn MetricsSink> = registry.clone();

        let metrics_server = config
            .prometheus
            .map(|addr| tokio::spawn(serve_metrics(addr, Arc::clone(&registry))));

        let (remediator, executor) = ScriptRemediator::spawn(config.script_path.clone());
        let remediator: Arc<dyn Remediator> = Arc::new(remediator);

        let games: Vec<Arc<GameRecoveryController>> = config
            .games
            .iter()
            .map(|target| {
                Arc::new(GameRecoveryController::new(
                    target.id.clone(),
                    target.port,
                    config.escalation_cooldown,
                    Arc::clone(&metrics),
                    Arc::clone(&remediator),
                ))
            })
            .collect();
        drop(remediator);

        let sender: Arc<dyn DatagramSender> = Arc::new(RawSocketSender::new());
        let register = Arc::new(ConnectionRegister::new(config.policy, sender));
        let mut dispatcher = Dispatcher::new(config.address, games, Arc::clone(&register));
        let mut dump_writer = None;
        if let Some(path) = &config.dump_packets {
            let (dump, writer) = PacketDump::create(path)?;
            dispatcher = dispatcher.with_dump(dump);
            dump_writer = Some(writer);
        }

        let cleanup = Arc::clone(&register).spawn_cleanup(config.cleanup_interval);

        let (queue, mut datagrams) = mpsc::channel(CAPTURE_QUEUE_SIZE);
        let capture = spawn_capture(
            config.source.clone(),
            PortFilter::new(config.ports()),
            Arc::clone(&metrics),
            queue,
        );

        info!(
            "Watchdog started for {} on ports {:?}",
            config.address,
            config.ports()
        );

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                datagram = datagrams.recv() => {
                    match datagram {
                        Some(datagram) => {
                            dispatcher.dispatch(&datagram).await;
                        }
                        None => {
                            info!("Capture finished");
                            break;
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("Received Ctrl+C, shutting down gracefully...");
                    break;
                }
            }
        }

        // Closing the queue stops the capture producer
        drop(datagrams);
        if let Err(e) = capture.await {
            error!("Capture task panicked: {}", e);
        }

        cleanup.stop().await;
        if let Some(server) = metrics_server {
            server.abort();
        }

        // The executor drains queued scripts once the last controller is gone
        drop(dispatcher);
        drop(register);
        if let Err(e) = executor.await {
            error!("Remediation executor panicked: {}", e);
        }
        if let Some(writer) = dump_writer {
            if let Err(e) = writer.await {
                error!("Packet dump writer panicked: {}", e);
            }
        }

        info!("Watchdog stopped");
        Ok(())
    }
}
