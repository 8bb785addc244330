//! Metrics sink and Prometheus text exposition
//!
//! Components never touch process-wide counters. They receive an
//! `Arc<dyn MetricsSink>` at construction and report [`MetricEvent`]s tagged
//! with the monitored game's identity. [`CounterRegistry`] is the production
//! sink; it keeps labelled series and renders them in the Prometheus text
//! format, optionally served over HTTP by [`serve_metrics`].

use crate::recovery::ReviveStrategy;
use log::info;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use warp::{reply, Filter, Rejection, Reply};

const CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Observable events emitted by the watchdog core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricEvent {
    ConnectionCreated,
    ConnectionEvicted,
    ForcedDisconnect,
    /// Server to client, bytes including IP/UDP headers
    PacketSent(usize),
    /// Client to server, payload bytes
    PacketReceived(usize),
    ReviveAttempted(ReviveStrategy),
}

pub trait MetricsSink: Send + Sync {
    fn record(&self, game: &str, event: MetricEvent);

    /// Capture failures are not tied to a game.
    fn capture_error(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Family {
    Packets,
    PacketBytes,
    ConnectionsActive,
    ConnectionsTotal,
    ForcedDisconnects,
    Revives,
    CaptureErrors,
}

impl Family {
    const ALL: [Family; 7] = [
        Family::Packets,
        Family::PacketBytes,
        Family::ConnectionsActive,
        Family::ConnectionsTotal,
        Family::ForcedDisconnects,
        Family::Revives,
        Family::CaptureErrors,
    ];

    fn name(self) -> &'static str {
        match self {
            Family::Packets => "civpb_watchdog_packets_total",
            Family::PacketBytes => "civpb_watchdog_packets_bytes_total",
            Family::ConnectionsActive => "civpb_watchdog_connections_active",
            Family::ConnectionsTotal => "civpb_watchdog_connections_total",
            Family::ForcedDisconnects => "civpb_watchdog_forced_disconnects_total",
            Family::Revives => "civpb_watchdog_game_revives_total",
            Family::CaptureErrors => "civpb_watchdog_capture_errors_total",
        }
    }

    fn help(self) -> &'static str {
        match self {
            Family::Packets => "Number of observed packets by the Civilization 4 Pitboss watchdog",
            Family::PacketBytes => "Size of observed packets by the Civilization 4 Pitboss watchdog",
            Family::ConnectionsActive => {
                "Number of active connections observed by the Civilization 4 Pitboss watchdog"
            }
            Family::ConnectionsTotal => {
                "Number of connections that were established by the Civilization 4 Pitboss watchdog"
            }
            Family::ForcedDisconnects => {
                "Number of times a connection was forcibly disconnected by the Civilization 4 Pitboss watchdog"
            }
            Family::Revives => "Number of times a game revive was attempted",
            Family::CaptureErrors => "Number of capture errors",
        }
    }

    fn kind(self) -> &'static str {
        match self {
            Family::ConnectionsActive => "gauge",
            _ => "counter",
        }
    }
}

type Labels = Vec<(&'static str, String)>;

/// Labelled counters and gauges for every monitored game
#[derive(Default)]
pub struct CounterRegistry {
    series: Mutex<BTreeMap<(Family, Labels), i64>>,
}

impl CounterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&self, family: Family, labels: Labels, delta: i64) {
        let mut series = self.series.lock().unwrap_or_else(PoisonError::into_inner);
        *series.entry((family, labels)).or_insert(0) += delta;
    }

    fn game_labels(game: &str) -> Labels {
        vec![("game", game.to_string())]
    }

    fn direction_labels(game: &str, direction: &str) -> Labels {
        vec![("game", game.to_string()), ("direction", direction.to_string())]
    }

    /// Current value of a series, mostly useful for inspection in tests
    pub fn value(&self, name: &str, labels: &[(&str, &str)]) -> Option<i64> {
        let series = self.series.lock().unwrap_or_else(PoisonError::into_inner);
        series.iter().find_map(|((family, series_labels), value)| {
            let matches = family.name() == name
                && series_labels.len() == labels.len()
                && series_labels
                    .iter()
                    .zip(labels)
                    .all(|((k1, v1), (k2, v2))| k1 == k2 && v1 == v2);
            matches.then_some(*value)
        })
    }

    /// Renders all series in the Prometheus text exposition format
    pub fn render(&self) -> String {
        let series = self.series.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out = String::new();

        out.push_str("# HELP civpb_watchdog_info Civilization 4 Pitboss watchdog version information\n");
        out.push_str("# TYPE civpb_watchdog_info gauge\n");
        out.push_str(&format!(
            "civpb_watchdog_info{{version=\"{}\"}} 1\n",
            env!("CARGO_PKG_VERSION")
        ));

        for family in Family::ALL {
            out.push_str(&format!("# HELP {} {}\n", family.name(), family.help()));
            out.push_str(&format!("# TYPE {} {}\n", family.name(), family.kind()));
            let members = series.iter().filter(|((f, _), _)| *f == family);
            for ((_, labels), value) in members {
                out.push_str(family.name());
                if !labels.is_empty() {
                    let rendered: Vec<String> = labels
                        .iter()
                        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label(v)))
                        .collect();
                    out.push_str(&format!("{{{}}}", rendered.join(",")));
                }
                out.push_str(&format!(" {}\n", value));
            }
        }
        out
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

impl MetricsSink for CounterRegistry {
    fn record(&self, game: &str, event: MetricEvent) {
        match event {
            MetricEvent::ConnectionCreated => {
                self.add(Family::ConnectionsTotal, Self::game_labels(game), 1);
                self.add(Family::ConnectionsActive, Self::game_labels(game), 1);
            }
            MetricEvent::ConnectionEvicted => {
                self.add(Family::ConnectionsActive, Self::game_labels(game), -1);
            }
            MetricEvent::ForcedDisconnect => {
                self.add(Family::ForcedDisconnects, Self::game_labels(game), 1);
            }
            MetricEvent::PacketSent(bytes) => {
                self.add(Family::Packets, Self::direction_labels(game, "out"), 1);
                self.add(
                    Family::PacketBytes,
                    Self::direction_labels(game, "out"),
                    bytes as i64,
                );
            }
            MetricEvent::PacketReceived(bytes) => {
                self.add(Family::Packets, Self::direction_labels(game, "in"), 1);
                self.add(
                    Family::PacketBytes,
                    Self::direction_labels(game, "in"),
                    bytes as i64,
                );
            }
            MetricEvent::ReviveAttempted(strategy) => {
                let labels = vec![
                    ("game", game.to_string()),
                    ("strategy", strategy.label().to_string()),
                ];
                self.add(Family::Revives, labels, 1);
            }
        }
    }

    fn capture_error(&self) {
        self.add(Family::CaptureErrors, Vec::new(), 1);
    }
}

/// GET on any path returns the current text exposition
pub fn metrics_route(
    registry: Arc<CounterRegistry>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::get().map(move || reply::with_header(registry.render(), "content-type", CONTENT_TYPE))
}

/// Serves [`metrics_route`] on `addr` until the task is aborted
pub async fn serve_metrics(addr: SocketAddr, registry: Arc<CounterRegistry>) {
    info!("Starting prometheus server on {}", addr);
    warp::serve(metrics_route(registry)).run(addr).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[test]
    fn test_connection_gauge() {
        let registry = CounterRegistry::new();
        registry.record("pb1", MetricEvent::ConnectionCreated);
        registry.record("pb1", MetricEvent::ConnectionCreated);
        registry.record("pb1", MetricEvent::ConnectionEvicted);

        assert_eq!(
            registry.value("civpb_watchdog_connections_active", &[("game", "pb1")]),
            Some(1)
        );
        assert_eq!(
            registry.value("civpb_watchdog_connections_total", &[("game", "pb1")]),
            Some(2)
        );
    }

    #[test]
    fn test_packet_counters_by_direction() {
        let registry = CounterRegistry::new();
        registry.record("pb1", MetricEvent::PacketSent(53));
        registry.record("pb1", MetricEvent::PacketSent(38));
        registry.record("pb1", MetricEvent::PacketReceived(12));

        let out = [("game", "pb1"), ("direction", "out")];
        let inbound = [("game", "pb1"), ("direction", "in")];
        assert_eq!(registry.value("civpb_watchdog_packets_total", &out), Some(2));
        assert_eq!(registry.value("civpb_watchdog_packets_bytes_total", &out), Some(91));
        assert_eq!(registry.value("civpb_watchdog_packets_total", &inbound), Some(1));
        assert_eq!(registry.value("civpb_watchdog_packets_bytes_total", &inbound), Some(12));
    }

    #[test]
    fn test_render_exposition() {
        let registry = CounterRegistry::new();
        registry.record("pb1", MetricEvent::ForcedDisconnect);
        registry.record("pb2", MetricEvent::ReviveAttempted(ReviveStrategy::PopupConfirm));
        registry.capture_error();

        let text = registry.render();
        assert!(text.contains("# TYPE civpb_watchdog_connections_active gauge"));
        assert!(text.contains("civpb_watchdog_forced_disconnects_total{game=\"pb1\"} 1\n"));
        assert!(text.contains(
            "civpb_watchdog_game_revives_total{game=\"pb2\",strategy=\"popup_confirm\"} 1\n"
        ));
        assert!(text.contains("civpb_watchdog_capture_errors_total 1\n"));
        assert!(text.contains("civpb_watchdog_info{version=\""));
    }

    /// Sends a raw HTTP/1.1 request to the endpoint, retrying while it starts
    async fn http_request(addr: SocketAddr, method: &str, path: &str) -> String {
        for _ in 0..50 {
            if let Ok(mut stream) = TcpStream::connect(addr).await {
                let request = format!(
                    "{} {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
                    method, path
                );
                stream.write_all(request.as_bytes()).await.unwrap();
                let mut response = String::new();
                stream.read_to_string(&mut response).await.unwrap();
                return response;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("metrics endpoint never came up on {}", addr);
    }

    fn free_addr() -> SocketAddr {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    #[tokio::test]
    async fn test_endpoint_serves_exposition() {
        let registry = Arc::new(CounterRegistry::new());
        registry.record("pb1", MetricEvent::ForcedDisconnect);
        let addr = free_addr();
        let server = tokio::spawn(serve_metrics(addr, Arc::clone(&registry)));

        for path in ["/metrics", "/"] {
            let response = http_request(addr, "GET", path).await;
            assert!(response.starts_with("HTTP/1.1 200 OK"));
            assert!(response.contains(CONTENT_TYPE));
            assert!(response.contains("civpb_watchdog_forced_disconnects_total{game=\"pb1\"} 1\n"));
        }

        // Rendered per request, not once at startup
        registry.record("pb1", MetricEvent::ForcedDisconnect);
        let response = http_request(addr, "GET", "/metrics").await;
        assert!(response.contains("civpb_watchdog_forced_disconnects_total{game=\"pb1\"} 2\n"));

        server.abort();
    }

    #[tokio::test]
    async fn test_endpoint_rejects_other_methods() {
        let addr = free_addr();
        let server = tokio::spawn(serve_metrics(addr, Arc::new(CounterRegistry::new())));

        let response = http_request(addr, "POST", "/metrics").await;
        assert!(response.starts_with("HTTP/1.1 405"));

        server.abort();
    }

    #[test]
    fn test_label_escaping() {
        assert_eq!(escape_label("a\"b"), "a\\\"b");
        assert_eq!(escape_label("c:\\games"), "c:\\\\games");
    }
}
