use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Duration;

pub struct Metrics {
    registry: Registry,

    // Forwarding
    pub forwarded_requests: IntCounter,
    pub forward_failures: IntCounter,
    pub forward_duration: Histogram,

    // Tunnels
    pub tunnels_opened: IntCounter,
    pub tunnels_failed: IntCounter,
    pub active_tunnels: IntGauge,

    // Capture and replay
    pub captures: IntCounter,
    pub capture_failures: IntCounter,
    pub replays: IntCounter,
    pub replay_failures: IntCounter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::new(name, help).expect("metric creation failed")
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let forwarded_requests = counter(
            "burst_proxy_forwarded_requests_total",
            "Total number of forwarded requests",
        );
        let forward_failures = counter(
            "burst_proxy_forward_failures_total",
            "Total number of requests that could not be forwarded",
        );
        let forward_duration = Histogram::with_opts(HistogramOpts::new(
            "burst_proxy_forward_duration_seconds",
            "Upstream round trip duration in seconds",
        ))
        .expect("metric creation failed");

        let tunnels_opened = counter(
            "burst_proxy_tunnels_opened_total",
            "Total number of CONNECT tunnels opened",
        );
        let tunnels_failed = counter(
            "burst_proxy_tunnels_failed_total",
            "Total number of CONNECT tunnels that failed",
        );
        let active_tunnels = IntGauge::new(
            "burst_proxy_active_tunnels",
            "Number of currently open tunnels",
        )
        .expect("metric creation failed");

        let captures = counter(
            "burst_proxy_captures_total",
            "Total number of captured requests",
        );
        let capture_failures = counter(
            "burst_proxy_capture_failures_total",
            "Total number of requests that could not be captured",
        );
        let replays = counter("burst_proxy_replays_total", "Total number of replays");
        let replay_failures = counter(
            "burst_proxy_replay_failures_total",
            "Total number of failed replays",
        );

        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(forwarded_requests.clone()),
            Box::new(forward_failures.clone()),
            Box::new(forward_duration.clone()),
            Box::new(tunnels_opened.clone()),
            Box::new(tunnels_failed.clone()),
            Box::new(active_tunnels.clone()),
            Box::new(captures.clone()),
            Box::new(capture_failures.clone()),
            Box::new(replays.clone()),
            Box::new(replay_failures.clone()),
        ];
        for collector in collectors {
            registry
                .register(collector)
                .expect("metric registration failed");
        }

        Self {
            registry,
            forwarded_requests,
            forward_failures,
            forward_duration,
            tunnels_opened,
            tunnels_failed,
            active_tunnels,
            captures,
            capture_failures,
            replays,
            replay_failures,
        }
    }

    pub fn record_forward(&self, duration: Duration) {
        self.forwarded_requests.inc();
        self.forward_duration.observe(duration.as_secs_f64());
    }

    pub fn record_forward_failure(&self, duration: Duration) {
        self.record_forward(duration);
        self.forward_failures.inc();
    }

    pub fn record_capture(&self, success: bool) {
        if success {
            self.captures.inc();
        } else {
            self.capture_failures.inc();
        }
    }

    pub fn record_replay(&self, success: bool) {
        self.replays.inc();
        if !success {
            self.replay_failures.inc();
        }
    }

    pub fn record_tunnel_failure(&self) {
        self.tunnels_failed.inc();
    }

    pub fn gather_metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Text exposition format.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.gather_metrics(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

/// Counts a tunnel as open for as long as the guard lives.
pub struct TunnelGuard {
    metrics: Arc<Metrics>,
}

impl TunnelGuard {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        metrics.tunnels_opened.inc();
        metrics.active_tunnels.inc();
        Self { metrics }
    }

    pub fn fail(&self) {
        self.metrics.record_tunnel_failure();
    }
}

impl Drop for TunnelGuard {
    fn drop(&mut self) {
        self.metrics.active_tunnels.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_guard_tracks_active_count() {
        let metrics = Arc::new(Metrics::new());
        {
            let guard = TunnelGuard::new(metrics.clone());
            let _other = TunnelGuard::new(metrics.clone());
            assert_eq!(metrics.active_tunnels.get(), 2);
            guard.fail();
        }
        assert_eq!(metrics.active_tunnels.get(), 0);
        assert_eq!(metrics.tunnels_opened.get(), 2);
        assert_eq!(metrics.tunnels_failed.get(), 1);
    }

    #[test]
    fn test_render_contains_counters() {
        let metrics = Metrics::new();
        metrics.record_replay(false);
        metrics.record_forward_failure(Duration::from_millis(5));

        let text = metrics.render();
        assert!(text.contains("burst_proxy_replays_total 1"));
        assert!(text.contains("burst_proxy_replay_failures_total 1"));
        assert!(text.contains("burst_proxy_forward_failures_total 1"));
        assert!(text.contains("burst_proxy_forward_duration_seconds_count 1"));
    }
}
