//! Metrics collection and export module

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use std::time::Instant;

/// Global metrics registry
pub struct Metrics {
    registry: Registry,

    // Allocation counters
    pub nonce_allocations: IntCounter,
    pub nonce_reclaimed_allocations: IntCounter,
    pub nonce_releases: IntCounter,
    pub nonce_submissions: IntCounter,
    pub nonce_stale_writes: IntCounter,

    // Reconciliation counters
    pub reconcile_runs: IntCounter,
    pub reconcile_failures: IntCounter,
    pub reconcile_adoptions: IntCounter,
    pub reconcile_remote_behind: IntCounter,
    pub reconcile_conflicts: IntCounter,
    pub reconcile_expired: IntCounter,
    pub oracle_timeouts: IntCounter,

    // Gauges
    pub open_resources: IntGauge,
    pub connected_chains: IntGauge,

    // Histograms
    pub allocate_latency: Histogram,
    pub oracle_latency: Histogram,
}

impl Metrics {
    /// Create new metrics instance
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let nonce_allocations = IntCounter::with_opts(Opts::new(
            "nonce_allocations_total",
            "Number of nonces handed out",
        ))?;
        let nonce_reclaimed_allocations = IntCounter::with_opts(Opts::new(
            "nonce_reclaimed_allocations_total",
            "Number of allocations served from a reclaimed expired nonce",
        ))?;
        let nonce_releases = IntCounter::with_opts(Opts::new(
            "nonce_releases_total",
            "Number of reserved nonces released without submission",
        ))?;
        let nonce_submissions = IntCounter::with_opts(Opts::new(
            "nonce_submissions_total",
            "Number of reservations confirmed as broadcast",
        ))?;
        let nonce_stale_writes = IntCounter::with_opts(Opts::new(
            "nonce_stale_writes_total",
            "Number of nonce store writes rejected below an in-flight nonce",
        ))?;

        let reconcile_runs = IntCounter::with_opts(Opts::new(
            "reconcile_runs_total",
            "Number of reconciliation passes",
        ))?;
        let reconcile_failures = IntCounter::with_opts(Opts::new(
            "reconcile_failures_total",
            "Number of reconciliation passes that ended in an error",
        ))?;
        let reconcile_adoptions = IntCounter::with_opts(Opts::new(
            "reconcile_adoptions_total",
            "Number of forward jumps adopted from the remote node",
        ))?;
        let reconcile_remote_behind = IntCounter::with_opts(Opts::new(
            "reconcile_remote_behind_total",
            "Number of times the remote node reported a count below local state",
        ))?;
        let reconcile_conflicts = IntCounter::with_opts(Opts::new(
            "reconcile_conflicts_total",
            "Number of unresolvable local/remote disagreements",
        ))?;
        let reconcile_expired = IntCounter::with_opts(Opts::new(
            "reconcile_expired_total",
            "Number of entries moved to expired by the reconciler",
        ))?;
        let oracle_timeouts = IntCounter::with_opts(Opts::new(
            "oracle_timeouts_total",
            "Number of remote oracle calls that exceeded their deadline",
        ))?;

        let open_resources = IntGauge::with_opts(Opts::new(
            "open_shared_resources",
            "Number of shared storage resources currently open",
        ))?;
        let connected_chains = IntGauge::with_opts(Opts::new(
            "connected_chains",
            "Number of chain connectors currently registered",
        ))?;

        let allocate_latency = Histogram::with_opts(
            HistogramOpts::new("nonce_allocate_latency_seconds", "Nonce allocation latency")
                .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5]),
        )?;
        let oracle_latency = Histogram::with_opts(
            HistogramOpts::new("oracle_latency_seconds", "Remote oracle call latency")
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0]),
        )?;

        registry.register(Box::new(nonce_allocations.clone()))?;
        registry.register(Box::new(nonce_reclaimed_allocations.clone()))?;
        registry.register(Box::new(nonce_releases.clone()))?;
        registry.register(Box::new(nonce_submissions.clone()))?;
        registry.register(Box::new(nonce_stale_writes.clone()))?;
        registry.register(Box::new(reconcile_runs.clone()))?;
        registry.register(Box::new(reconcile_failures.clone()))?;
        registry.register(Box::new(reconcile_adoptions.clone()))?;
        registry.register(Box::new(reconcile_remote_behind.clone()))?;
        registry.register(Box::new(reconcile_conflicts.clone()))?;
        registry.register(Box::new(reconcile_expired.clone()))?;
        registry.register(Box::new(oracle_timeouts.clone()))?;
        registry.register(Box::new(open_resources.clone()))?;
        registry.register(Box::new(connected_chains.clone()))?;
        registry.register(Box::new(allocate_latency.clone()))?;
        registry.register(Box::new(oracle_latency.clone()))?;

        Ok(Self {
            registry,
            nonce_allocations,
            nonce_reclaimed_allocations,
            nonce_releases,
            nonce_submissions,
            nonce_stale_writes,
            reconcile_runs,
            reconcile_failures,
            reconcile_adoptions,
            reconcile_remote_behind,
            reconcile_conflicts,
            reconcile_expired,
            oracle_timeouts,
            open_resources,
            connected_chains,
            allocate_latency,
            oracle_latency,
        })
    }

    /// Get the registry for exporting
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text format
    pub fn render(&self) -> anyhow::Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }
}

/// Global metrics instance
pub fn metrics() -> &'static Metrics {
    static METRICS: once_cell::sync::Lazy<Metrics> =
        once_cell::sync::Lazy::new(|| Metrics::new().expect("Failed to initialize metrics"));
    &METRICS
}

/// Timer helper for measuring operation duration
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn observe_duration(&self, histogram: &Histogram) {
        histogram.observe(self.start.elapsed().as_secs_f64());
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_registered_metrics() {
        let m = metrics();
        m.nonce_allocations.inc();
        let text = m.render().unwrap();
        assert!(text.contains("nonce_allocations_total"));
        assert!(text.contains("reconcile_runs_total"));
    }

    #[test]
    fn test_timer_observes_histogram() {
        let m = metrics();
        let before = m.oracle_latency.get_sample_count();
        let timer = Timer::new();
        timer.observe_duration(&m.oracle_latency);
        assert!(m.oracle_latency.get_sample_count() > before);
    }
}
