//! Process-wide Prometheus metrics registry.
//!
//! The process holds at most two singletons: a shared logger (set up once
//! in `relay-server`'s `main` via `tracing_subscriber`) and this metrics
//! registry. Everything else is instance-scoped and injected.

use std::time::{SystemTime, UNIX_EPOCH};

use prometheus::{IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

/// Bytes/peer/handshake counters exposed over the relay's metrics
/// endpoint.
pub struct Metrics {
    pub registry: Registry,
    pub bytes_sent: IntCounter,
    pub bytes_received: IntCounter,
    pub active_peers: IntGauge,
    pub handshake_failures: IntCounterVec,
    pub auth_failures: IntCounter,
    pub backpressure_drops: IntCounter,
    pub peer_activity: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let bytes_sent =
            IntCounter::new("relay_bytes_sent_total", "Total bytes forwarded to peers").unwrap();
        let bytes_received = IntCounter::new(
            "relay_bytes_received_total",
            "Total bytes received from peers",
        )
        .unwrap();
        let active_peers =
            IntGauge::new("relay_active_peers", "Currently registered peer sessions").unwrap();
        let handshake_failures = IntCounterVec::new(
            Opts::new("relay_handshake_failures_total", "Handshake failures by reason"),
            &["reason"],
        )
        .unwrap();
        let auth_failures =
            IntCounter::new("relay_auth_failures_total", "Rejected auth tokens").unwrap();
        let backpressure_drops = IntCounter::new(
            "relay_backpressure_drops_total",
            "Transport frames dropped due to a full consumer channel",
        )
        .unwrap();
        let peer_activity = IntGaugeVec::new(
            Opts::new(
                "relay_peer_last_activity_timestamp_seconds",
                "Unix timestamp of the last frame seen from a peer",
            ),
            &["peer_id"],
        )
        .unwrap();

        registry.register(Box::new(bytes_sent.clone())).unwrap();
        registry
            .register(Box::new(bytes_received.clone()))
            .unwrap();
        registry.register(Box::new(active_peers.clone())).unwrap();
        registry
            .register(Box::new(handshake_failures.clone()))
            .unwrap();
        registry.register(Box::new(auth_failures.clone())).unwrap();
        registry
            .register(Box::new(backpressure_drops.clone()))
            .unwrap();
        registry.register(Box::new(peer_activity.clone())).unwrap();

        Metrics {
            registry,
            bytes_sent,
            bytes_received,
            active_peers,
            handshake_failures,
            auth_failures,
            backpressure_drops,
            peer_activity,
        }
    }

    /// Records that a frame was just seen from `peer_id`, for the
    /// per-peer last-activity gauge.
    pub fn record_peer_activity(&self, peer_id: &str) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        self.peer_activity.with_label_values(&[peer_id]).set(now);
    }

    /// Renders the registry in the Prometheus text exposition format, for
    /// the `/metrics` HTTP handler.
    pub fn render(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&families, &mut buf).unwrap();
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_registered_metric_names() {
        let m = Metrics::new();
        m.bytes_sent.inc_by(42);
        m.active_peers.set(3);
        let out = m.render();
        assert!(out.contains("relay_bytes_sent_total"));
        assert!(out.contains("relay_active_peers"));
    }

    #[test]
    fn record_peer_activity_sets_a_nonzero_timestamp() {
        let m = Metrics::new();
        m.record_peer_activity("deadbeef");
        let value = m.peer_activity.with_label_values(&["deadbeef"]).get();
        assert!(value > 0);
    }
}
