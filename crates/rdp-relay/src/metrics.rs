//! Metrics collection and export

use std::time::{Duration, Instant};

use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

/// Relay metrics
pub struct RelayMetrics {
    active_sessions: Gauge,
    claimed_backends: Gauge,
    sessions_total: Counter,
    sessions_declined: Counter,
    connect_failures: Counter,
    claims_lost: Counter,
    bytes_forwarded: Counter,
    store_errors: Counter,
    claims_marked: Counter,
    claims_expired: Counter,
    session_duration: Histogram,
    registry: Registry,
    start_time: Instant,
}

impl RelayMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let active_sessions = Gauge::with_opts(Opts::new(
            "rdp_relay_active_sessions",
            "Number of sessions relaying to a backend",
        ))?;
        registry.register(Box::new(active_sessions.clone()))?;

        let claimed_backends = Gauge::with_opts(Opts::new(
            "rdp_relay_claimed_backends",
            "Backends currently holding a claim, pending or not",
        ))?;
        registry.register(Box::new(claimed_backends.clone()))?;

        let sessions_total = Counter::with_opts(Opts::new(
            "rdp_relay_sessions_total",
            "Total client connections accepted",
        ))?;
        registry.register(Box::new(sessions_total.clone()))?;

        let sessions_declined = Counter::with_opts(Opts::new(
            "rdp_relay_sessions_declined_total",
            "Sessions answered with the decline handshake",
        ))?;
        registry.register(Box::new(sessions_declined.clone()))?;

        let connect_failures = Counter::with_opts(Opts::new(
            "rdp_relay_backend_connect_failures_total",
            "Failed backend connection attempts",
        ))?;
        registry.register(Box::new(connect_failures.clone()))?;

        let claims_lost = Counter::with_opts(Opts::new(
            "rdp_relay_claims_lost_total",
            "Selections whose claim was taken by another client first",
        ))?;
        registry.register(Box::new(claims_lost.clone()))?;

        let bytes_forwarded = Counter::with_opts(Opts::new(
            "rdp_relay_bytes_forwarded_total",
            "Total bytes forwarded in both directions",
        ))?;
        registry.register(Box::new(bytes_forwarded.clone()))?;

        let store_errors = Counter::with_opts(Opts::new(
            "rdp_relay_store_errors_total",
            "Pool store operations that failed",
        ))?;
        registry.register(Box::new(store_errors.clone()))?;

        let claims_marked = Counter::with_opts(Opts::new(
            "rdp_relay_claims_marked_total",
            "Orphaned claims marked for release",
        ))?;
        registry.register(Box::new(claims_marked.clone()))?;

        let claims_expired = Counter::with_opts(Opts::new(
            "rdp_relay_claims_expired_total",
            "Claims freed after the grace window",
        ))?;
        registry.register(Box::new(claims_expired.clone()))?;

        let session_duration = Histogram::with_opts(
            HistogramOpts::new(
                "rdp_relay_session_duration_seconds",
                "Relay session duration in seconds",
            )
            .buckets(vec![1.0, 10.0, 60.0, 300.0, 1800.0, 3600.0, 14400.0, 86400.0]),
        )?;
        registry.register(Box::new(session_duration.clone()))?;

        Ok(Self {
            active_sessions,
            claimed_backends,
            sessions_total,
            sessions_declined,
            connect_failures,
            claims_lost,
            bytes_forwarded,
            store_errors,
            claims_marked,
            claims_expired,
            session_duration,
            registry,
            start_time: Instant::now(),
        })
    }

    pub fn record_session_accepted(&self) {
        self.sessions_total.inc();
    }

    pub fn record_session_assigned(&self) {
        self.active_sessions.inc();
    }

    pub fn record_session_finished(&self, assigned: bool, duration: Duration) {
        if assigned {
            self.active_sessions.dec();
        }
        self.session_duration.observe(duration.as_secs_f64());
    }

    pub fn record_declined(&self) {
        self.sessions_declined.inc();
    }

    pub fn record_connect_failure(&self) {
        self.connect_failures.inc();
    }

    pub fn record_claim_lost(&self) {
        self.claims_lost.inc();
    }

    pub fn record_forward(&self, bytes: usize) {
        self.bytes_forwarded.inc_by(bytes as f64);
    }

    pub fn record_store_error(&self) {
        self.store_errors.inc();
    }

    pub fn record_reconcile(&self, marked: usize, freed: usize) {
        self.claims_marked.inc_by(marked as f64);
        self.claims_expired.inc_by(freed as f64);
    }

    pub fn set_claimed_backends(&self, count: usize) {
        self.claimed_backends.set(count as f64);
    }

    /// Export Prometheus format
    pub fn export(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).to_string())
    }

    pub fn sessions_total(&self) -> f64 {
        self.sessions_total.get()
    }

    pub fn sessions_declined(&self) -> f64 {
        self.sessions_declined.get()
    }

    pub fn bytes_forwarded(&self) -> f64 {
        self.bytes_forwarded.get()
    }

    pub fn active_sessions(&self) -> f64 {
        self.active_sessions.get()
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_contains_counters() {
        let metrics = RelayMetrics::new().unwrap();
        metrics.record_session_accepted();
        metrics.record_declined();
        metrics.record_forward(42);

        let text = metrics.export().unwrap();
        assert!(text.contains("rdp_relay_sessions_total 1"));
        assert!(text.contains("rdp_relay_sessions_declined_total 1"));
        assert!(text.contains("rdp_relay_bytes_forwarded_total 42"));
    }

    #[test]
    fn test_active_gauge_tracks_assigned_sessions_only() {
        let metrics = RelayMetrics::new().unwrap();
        metrics.record_session_assigned();
        metrics.record_session_finished(false, Duration::from_millis(5));
        assert_eq!(metrics.active_sessions(), 1.0);
        metrics.record_session_finished(true, Duration::from_secs(3));
        assert_eq!(metrics.active_sessions(), 0.0);
    }
}
