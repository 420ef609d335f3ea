use prometheus::{CounterVec, Gauge, Histogram, HistogramOpts, Opts, Registry};
use std::sync::Arc;

/// Metrics collector for admission decisions
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    admitted_requests: CounterVec,
    rejected_requests: CounterVec,
    bypassed_requests: CounterVec,
    buckets_active: Gauge,
    decision_duration: Histogram,
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let admitted_requests = CounterVec::new(
            Opts::new(
                "admission_admitted_requests",
                "Number of requests admitted by the rate limiter",
            ),
            &["tier"],
        )?;

        let rejected_requests = CounterVec::new(
            Opts::new(
                "admission_rejected_requests",
                "Number of requests rejected with 429",
            ),
            &["tier"],
        )?;

        let bypassed_requests = CounterVec::new(
            Opts::new(
                "admission_bypassed_requests",
                "Number of requests forwarded without a rate limit check",
            ),
            &["reason"],
        )?;

        let buckets_active = Gauge::new(
            "admission_buckets_active",
            "Number of token buckets held by the registry",
        )?;

        let decision_duration = Histogram::with_opts(HistogramOpts::new(
            "admission_decision_duration_seconds",
            "Time spent deciding whether to admit a request",
        ))?;

        registry.register(Box::new(admitted_requests.clone()))?;
        registry.register(Box::new(rejected_requests.clone()))?;
        registry.register(Box::new(bypassed_requests.clone()))?;
        registry.register(Box::new(buckets_active.clone()))?;
        registry.register(Box::new(decision_duration.clone()))?;

        Ok(Self {
            registry,
            admitted_requests,
            rejected_requests,
            bypassed_requests,
            buckets_active,
            decision_duration,
        })
    }

    /// Get the Prometheus registry for this metrics instance
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_admitted(&self, tier: &str) {
        self.admitted_requests.with_label_values(&[tier]).inc();
    }

    pub fn record_rejected(&self, tier: &str) {
        self.rejected_requests.with_label_values(&[tier]).inc();
    }

    pub fn record_bypassed(&self, reason: &str) {
        self.bypassed_requests.with_label_values(&[reason]).inc();
    }

    pub fn set_buckets_active(&self, count: usize) {
        self.buckets_active.set(count as f64);
    }

    /// Create a timer for measuring decision duration
    pub fn start_decision_timer(&self) -> prometheus::HistogramTimer {
        self.decision_duration.start_timer()
    }

    /// Render all metrics in the Prometheus text format
    pub fn encode(&self) -> prometheus::Result<String> {
        prometheus::TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}
