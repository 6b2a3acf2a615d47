//! Metrics seam.
//!
//! A concrete metrics pipeline is out of scope for this crate, but
//! `metrics.*` configuration is still a recognized option and a complete
//! crate still needs somewhere to plug a real sink in. `MetricsSink` is
//! that seam: a small trait recording the handful of counters this
//! crate's components can usefully report, plus a no-op default that
//! honors `metrics.disableMetrics` by construction (nothing is ever
//! recorded through it).

use std::sync::atomic::{AtomicU64, Ordering};

/// Named counters this crate increments. Kept as an enum rather than
/// free-form strings so a concrete sink can match exhaustively instead of
/// guessing at metric names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    /// A certificate was issued by a `CertificateGenerator`.
    CertificateIssued,
    /// An issuance attempt failed.
    CertificateGenerationFailed,
    /// `VerifyIdentityPipeline::verify_client_certificate` returned true.
    IdentityVerified,
    /// `VerifyIdentityPipeline::verify_client_certificate` returned false.
    IdentityRejected,
    /// A background refresh run completed.
    BackgroundRefreshCompleted,
    /// `PolicyEvaluator::authorize` returned true.
    AuthorizationGranted,
    /// `PolicyEvaluator::authorize` returned false.
    AuthorizationDenied,
}

/// Receives counter increments from the domain. Implementations must be
/// cheap and non-blocking; this is called from request-handling paths.
pub trait MetricsSink: Send + Sync {
    /// Increment `counter` by one.
    fn increment(&self, counter: Counter);
}

/// Discards every increment. The default sink when `metrics.disableMetrics`
/// is true, or when a host hasn't wired in a real aggregator.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn increment(&self, _counter: Counter) {}
}

/// In-process counting sink, for tests and for a host that wants simple
/// in-memory aggregation without a full metrics backend.
#[derive(Default)]
pub struct InMemoryMetricsSink {
    certificate_issued: AtomicU64,
    certificate_generation_failed: AtomicU64,
    identity_verified: AtomicU64,
    identity_rejected: AtomicU64,
    background_refresh_completed: AtomicU64,
    authorization_granted: AtomicU64,
    authorization_denied: AtomicU64,
}

impl InMemoryMetricsSink {
    /// Construct a sink with every counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of `counter`.
    pub fn count(&self, counter: Counter) -> u64 {
        self.cell(counter).load(Ordering::Relaxed)
    }

    fn cell(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::CertificateIssued => &self.certificate_issued,
            Counter::CertificateGenerationFailed => &self.certificate_generation_failed,
            Counter::IdentityVerified => &self.identity_verified,
            Counter::IdentityRejected => &self.identity_rejected,
            Counter::BackgroundRefreshCompleted => &self.background_refresh_completed,
            Counter::AuthorizationGranted => &self.authorization_granted,
            Counter::AuthorizationDenied => &self.authorization_denied,
        }
    }
}

impl MetricsSink for InMemoryMetricsSink {
    fn increment(&self, counter: Counter) {
        self.cell(counter).fetch_add(1, Ordering::Relaxed);
    }
}

/// Build the configured sink: `NoopMetricsSink` when
/// `metrics.disableMetrics` is set, `InMemoryMetricsSink` otherwise. A host
/// wanting a real aggregator (CloudWatch, StatsD, ...) swaps this out for
/// its own `MetricsSink` implementation; this function only decides the
/// in-crate default.
pub fn sink_for(config: &crate::config::MetricsConfig) -> std::sync::Arc<dyn MetricsSink> {
    if config.disable_metrics {
        std::sync::Arc::new(NoopMetricsSink)
    } else {
        std::sync::Arc::new(InMemoryMetricsSink::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_sink_counts_increments_per_counter() {
        let sink = InMemoryMetricsSink::new();
        sink.increment(Counter::CertificateIssued);
        sink.increment(Counter::CertificateIssued);
        sink.increment(Counter::IdentityVerified);
        assert_eq!(sink.count(Counter::CertificateIssued), 2);
        assert_eq!(sink.count(Counter::IdentityVerified), 1);
        assert_eq!(sink.count(Counter::AuthorizationDenied), 0);
    }

    #[test]
    fn disabled_metrics_config_selects_the_noop_sink() {
        let config = crate::config::MetricsConfig { disable_metrics: true, aggregate_period_seconds: 60 };
        let sink = sink_for(&config);
        // Exercised only for the side effect of not panicking; the noop
        // sink has no observable state to assert against.
        sink.increment(Counter::CertificateIssued);
    }
}
