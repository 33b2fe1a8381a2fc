//! Prometheus metrics for the proxy

use prometheus::{IntCounter, Registry};

/// Metrics owned by one proxy instance.
#[derive(Debug, Clone)]
pub struct ProxyMetrics {
    /// Number of backend streams that completed without producing a single
    /// response.
    pub empty_stream_responses: IntCounter,
}

impl ProxyMetrics {
    /// Create the metrics and register them with `registry`.
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let metrics = Self::unregistered()?;
        registry.register(Box::new(metrics.empty_stream_responses.clone()))?;
        Ok(metrics)
    }

    /// Create the metrics without registering them anywhere.
    pub fn unregistered() -> prometheus::Result<Self> {
        Ok(Self {
            empty_stream_responses: IntCounter::new(
                "querymesh_proxy_store_empty_stream_responses_total",
                "Total number of empty responses received.",
            )?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        let registry = Registry::new();
        let metrics = ProxyMetrics::new(&registry).unwrap();

        metrics.empty_stream_responses.inc();

        let families = registry.gather();
        assert_eq!(families.len(), 1);
        assert_eq!(
            families[0].get_name(),
            "querymesh_proxy_store_empty_stream_responses_total"
        );
        assert_eq!(families[0].get_metric()[0].get_counter().get_value(), 1.0);
    }
}
