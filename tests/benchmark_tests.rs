//! Performance benchmarks for the packet hot paths

use shared::{Datagram, FlowKey};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use watchdog::connection::ConnectionPolicy;
use watchdog::connection_register::ConnectionRegister;
use watchdog::disconnect::{build_datagram, disconnect_body, DatagramSender};
use watchdog::dispatcher::Dispatcher;
use watchdog::error::SendError;
use watchdog::metrics::{CounterRegistry, MetricEvent, MetricsSink};
use watchdog::recovery::GameRecoveryController;
use watchdog::remediation::{RemediationAction, Remediator};

const SERVER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

struct DiscardSender;

impl DatagramSender for DiscardSender {
    fn send(&self, _datagram: &[u8], _destination: Ipv4Addr) -> Result<(), SendError> {
        Ok(())
    }
}

struct NoRemediation;

impl Remediator for NoRemediation {
    fn remediate(&self, _game_id: &str, _action: RemediationAction) {}
}

fn dispatcher() -> Dispatcher {
    let metrics: Arc<dyn MetricsSink> = Arc::new(CounterRegistry::new());
    let game = Arc::new(GameRecoveryController::new(
        "pb1",
        2056,
        Duration::from_secs(30),
        metrics,
        Arc::new(NoRemediation),
    ));
    let register = Arc::new(ConnectionRegister::new(
        ConnectionPolicy::default(),
        Arc::new(DiscardSender),
    ));
    Dispatcher::new(SERVER, [game], register)
}

/// Benchmarks dispatch of server packets across many client flows
#[test]
fn benchmark_dispatch() {
    let dispatcher = dispatcher();
    let iterations = 100_000u64;

    let start = Instant::now();
    tokio_test::block_on(async {
        for i in 0..iterations {
            let datagram = Datagram {
                source: SERVER,
                source_port: 2056,
                destination: Ipv4Addr::new(192, 168, 1, (i % 32) as u8),
                destination_port: 50000 + ((i / 32) % 4) as u16,
                payload: vec![0xfe; 25],
                captured_at: Duration::from_secs(1_700_000_000) + Duration::from_millis(i),
            };
            dispatcher.dispatch(&datagram).await;
        }
    });
    let duration = start.elapsed();

    println!(
        "Dispatch: {} datagrams in {:?} ({:.2} ns/datagram)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert_eq!(tokio_test::block_on(dispatcher.register().len()), 128);
    // Generous bound for unoptimized builds
    assert!(duration.as_secs() < 20);
}

/// Benchmarks building the spoofed disconnect datagram
#[test]
fn benchmark_disconnect_build() {
    let flow = FlowKey::new(Ipv4Addr::new(192, 168, 1, 50), 51234, SERVER, 2056);
    let trigger = [0xfe, 0xfe, 0x01, 0x12, 0x34, 0xab, 0xcd, 0x00, 0x00, 0x00];
    let iterations = 100_000;

    let start = Instant::now();
    for _ in 0..iterations {
        let body = disconnect_body(&trigger).unwrap();
        let datagram = build_datagram(&flow, &body).unwrap();
        assert_eq!(datagram.len(), 35);
    }
    let duration = start.elapsed();

    println!(
        "Disconnect build: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert!(duration.as_secs() < 10);
}

/// Benchmarks metric recording and rendering with many series
#[test]
fn benchmark_metrics_render() {
    let registry = CounterRegistry::new();
    for game in 0..50 {
        let game = format!("pb{}", game);
        for _ in 0..100 {
            registry.record(&game, MetricEvent::PacketSent(53));
            registry.record(&game, MetricEvent::PacketReceived(12));
        }
    }

    let iterations = 1_000;
    let start = Instant::now();
    for _ in 0..iterations {
        let rendered = registry.render();
        assert!(rendered.contains("civpb_watchdog_packets_total"));
    }
    let duration = start.elapsed();

    println!(
        "Metrics render: {} iterations in {:?} ({:.2} us/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_secs() < 20);
}
