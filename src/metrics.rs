use std::sync::Arc;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FetchLabels {
    pub success: String,
    pub updated: String,
}

impl FetchLabels {
    pub fn new(success: bool, updated: bool) -> Self {
        Self {
            success: success.to_string(),
            updated: updated.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the poller.
pub struct Metrics {
    // -- scheduling --
    pub poll_total: Counter,
    pub ticks_skipped_total: Counter,
    pub active_repositories: Gauge,

    // -- fetch --
    pub fetch_duration_seconds: Family<FetchLabels, Histogram>,

    // -- changes --
    pub reference_updates_total: Counter,
    pub events_published_total: Counter,
}

impl Metrics {
    /// Create the metrics and register each with `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let poll_total = Counter::default();
        registry.register(
            "forgewatch_poll",
            "Repository poll attempts",
            poll_total.clone(),
        );

        let ticks_skipped_total = Counter::default();
        registry.register(
            "forgewatch_ticks_skipped",
            "Scheduler ticks skipped because the previous tick was still draining",
            ticks_skipped_total.clone(),
        );

        let active_repositories: Gauge = Gauge::default();
        registry.register(
            "forgewatch_active_repositories",
            "Repositories loaded by the most recent tick",
            active_repositories.clone(),
        );

        let fetch_duration_seconds =
            Family::<FetchLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.05, 2.0, 12))
            });
        registry.register(
            "forgewatch_fetch_duration_seconds",
            "Fetch latency in seconds by outcome",
            fetch_duration_seconds.clone(),
        );

        let reference_updates_total = Counter::default();
        registry.register(
            "forgewatch_reference_updates",
            "Tracked references whose head moved",
            reference_updates_total.clone(),
        );

        let events_published_total = Counter::default();
        registry.register(
            "forgewatch_events_published",
            "Change events published to the bus",
            events_published_total.clone(),
        );

        Self {
            poll_total,
            ticks_skipped_total,
            active_repositories,
            fetch_duration_seconds,
            reference_updates_total,
            events_published_total,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// OpenMetrics text exposition of every registered metric.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut body = String::new();
        prometheus_client::encoding::text::encode(&mut body, &self.registry)?;
        Ok(body)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_exposed_with_total_suffix() {
        let registry = MetricsRegistry::new();
        registry.metrics.poll_total.inc();
        registry
            .metrics
            .fetch_duration_seconds
            .get_or_create(&FetchLabels::new(true, false))
            .observe(0.2);

        let body = registry.encode().unwrap();
        assert!(body.contains("forgewatch_poll_total 1"));
        assert!(body.contains("forgewatch_ticks_skipped_total 0"));
        assert!(body.contains("forgewatch_fetch_duration_seconds_count{success=\"true\",updated=\"false\"} 1"));
        assert!(body.contains("# EOF"));
    }
}
