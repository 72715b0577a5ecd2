use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, StreamError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamMetricsSnapshot {
    pub events_received: u64,
    pub events_delivered: u64,
    pub aggregations_delivered: u64,
    pub events_blocked: u64,
    pub events_client_filtered: u64,
    pub events_throttled: u64,
    pub fail_open_deliveries: u64,
    pub transport_errors: u64,
    pub commands_handled: u64,
    pub connected_clients: u64,
}

/// Prometheus instruments for the delivery pipeline.
pub struct StreamMetrics {
    registry: Registry,
    events_received: Counter,
    events_delivered: Counter,
    aggregations_delivered: Counter,
    events_blocked: Counter,
    events_client_filtered: Counter,
    events_throttled: Counter,
    fail_open_deliveries: Counter,
    transport_errors: Counter,
    commands_handled: Counter,
    connected_clients: Gauge,
    filter_latency: Histogram,
}

impl StreamMetrics {
    pub fn new() -> Result<Self> {
        info!("Initializing stream metrics");
        let registry = Registry::new();

        let events_received = Counter::new("siem_stream_events_received_total", "Events handed to the orchestrator")?;
        let events_delivered = Counter::new("siem_stream_events_delivered_total", "Individual events delivered to clients")?;
        let aggregations_delivered = Counter::new(
            "siem_stream_aggregations_delivered_total",
            "Aggregation windows delivered to clients",
        )?;
        let events_blocked = Counter::new("siem_stream_events_blocked_total", "Events blocked by smart filtering")?;
        let events_client_filtered = Counter::new(
            "siem_stream_events_client_filtered_total",
            "Events dropped by client-level filters",
        )?;
        let events_throttled = Counter::new(
            "siem_stream_events_throttled_total",
            "Deliverables dropped by per-client admission control",
        )?;
        let fail_open_deliveries = Counter::new(
            "siem_stream_fail_open_total",
            "Events delivered unfiltered after a filtering failure",
        )?;
        let transport_errors = Counter::new("siem_stream_transport_errors_total", "Failed deliveries")?;
        let commands_handled = Counter::new("siem_stream_commands_total", "Control commands handled")?;
        let connected_clients = Gauge::new("siem_stream_connected_clients", "Currently connected clients")?;
        let filter_latency = Histogram::with_opts(
            HistogramOpts::new("siem_stream_filter_latency_seconds", "Smart filtering time per event")
                .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5]),
        )?;

        registry.register(Box::new(events_received.clone()))?;
        registry.register(Box::new(events_delivered.clone()))?;
        registry.register(Box::new(aggregations_delivered.clone()))?;
        registry.register(Box::new(events_blocked.clone()))?;
        registry.register(Box::new(events_client_filtered.clone()))?;
        registry.register(Box::new(events_throttled.clone()))?;
        registry.register(Box::new(fail_open_deliveries.clone()))?;
        registry.register(Box::new(transport_errors.clone()))?;
        registry.register(Box::new(commands_handled.clone()))?;
        registry.register(Box::new(connected_clients.clone()))?;
        registry.register(Box::new(filter_latency.clone()))?;

        Ok(Self {
            registry,
            events_received,
            events_delivered,
            aggregations_delivered,
            events_blocked,
            events_client_filtered,
            events_throttled,
            fail_open_deliveries,
            transport_errors,
            commands_handled,
            connected_clients,
            filter_latency,
        })
    }

    pub fn record_event_received(&self) {
        self.events_received.inc();
    }

    pub fn record_event_delivered(&self) {
        self.events_delivered.inc();
    }

    pub fn record_aggregation_delivered(&self) {
        self.aggregations_delivered.inc();
    }

    pub fn record_blocked(&self) {
        self.events_blocked.inc();
    }

    pub fn record_client_filtered(&self) {
        self.events_client_filtered.inc();
    }

    pub fn record_throttled(&self) {
        self.events_throttled.inc();
    }

    pub fn record_fail_open(&self) {
        self.fail_open_deliveries.inc();
    }

    pub fn record_transport_error(&self) {
        self.transport_errors.inc();
    }

    pub fn record_command(&self) {
        self.commands_handled.inc();
    }

    pub fn record_filter_latency(&self, processing_time_ms: f64) {
        self.filter_latency.observe(processing_time_ms / 1000.0);
    }

    pub fn set_connected_clients(&self, count: usize) {
        self.connected_clients.set(count as f64);
    }

    pub fn snapshot(&self) -> StreamMetricsSnapshot {
        StreamMetricsSnapshot {
            events_received: self.events_received.get() as u64,
            events_delivered: self.events_delivered.get() as u64,
            aggregations_delivered: self.aggregations_delivered.get() as u64,
            events_blocked: self.events_blocked.get() as u64,
            events_client_filtered: self.events_client_filtered.get() as u64,
            events_throttled: self.events_throttled.get() as u64,
            fail_open_deliveries: self.fail_open_deliveries.get() as u64,
            transport_errors: self.transport_errors.get() as u64,
            commands_handled: self.commands_handled.get() as u64,
            connected_clients: self.connected_clients.get() as u64,
        }
    }

    /// Prometheus text exposition format.
    pub fn export(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| StreamError::internal(format!("Metrics output is not UTF-8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_export() {
        let metrics = StreamMetrics::new().unwrap();
        metrics.record_event_received();
        metrics.record_event_received();
        metrics.record_fail_open();
        metrics.set_connected_clients(3);
        metrics.record_filter_latency(2.5);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.events_received, 2);
        assert_eq!(snapshot.fail_open_deliveries, 1);
        assert_eq!(snapshot.connected_clients, 3);

        let text = metrics.export().unwrap();
        assert!(text.contains("siem_stream_events_received_total 2"));
        assert!(text.contains("siem_stream_filter_latency_seconds_count 1"));
    }

    #[test]
    fn test_independent_registries() {
        // Each instance owns its registry, so several can coexist in one process.
        let a = StreamMetrics::new().unwrap();
        let b = StreamMetrics::new().unwrap();
        a.record_blocked();
        assert_eq!(b.snapshot().events_blocked, 0);
    }
}
