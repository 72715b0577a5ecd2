//! Channel Manager - per-client channel multiplexing and time-windowed
//! aggregation.
//!
//! Routing is synchronous and per-channel: every open channel is tested
//! against the event under its own map entry lock. Aggregation windows are
//! flushed lazily when the next matching event arrives after the window has
//! elapsed, by the periodic sweep, or early when the buffer is full.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};
use uuid::Uuid;

use crate::conditions::{AdvancedFilter, ConditionEvaluator};
use crate::config::ChannelsConfig;
use crate::error::{Result, StreamError};
use crate::models::{Priority, StreamEvent};

fn default_channel_type() -> String {
    "all".to_string()
}

/// Client-supplied channel definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default = "default_channel_type")]
    pub channel_type: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub filters: Vec<AdvancedFilter>,
    /// 0 disables aggregation.
    #[serde(default)]
    pub aggregation_window_ms: u64,
}

impl ChannelConfig {
    pub fn new(channel_type: impl Into<String>) -> Self {
        Self {
            channel_type: channel_type.into(),
            priority: Priority::Normal,
            filters: Vec::new(),
            aggregation_window_ms: 0,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_filters(mut self, filters: Vec<AdvancedFilter>) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_aggregation(mut self, window_ms: u64) -> Self {
        self.aggregation_window_ms = window_ms;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelMetrics {
    pub events_routed: u64,
    pub events_aggregated: u64,
    pub aggregations_emitted: u64,
    /// Running average of event age at routing time.
    pub average_latency_ms: f64,
    pub last_event_at: Option<DateTime<Utc>>,
}

impl ChannelMetrics {
    fn record(&mut self, latency_ms: f64, now: DateTime<Utc>) {
        self.events_routed += 1;
        self.average_latency_ms += (latency_ms - self.average_latency_ms) / self.events_routed as f64;
        self.last_event_at = Some(now);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub client_id: String,
    pub channel_type: String,
    pub priority: Priority,
    pub filters: Vec<AdvancedFilter>,
    pub aggregation_window_ms: u64,
    pub created_at: DateTime<Utc>,
    pub metrics: ChannelMetrics,
}

impl Channel {
    pub fn is_aggregating(&self) -> bool {
        self.aggregation_window_ms > 0
    }

    fn window(&self) -> Duration {
        Duration::milliseconds(self.aggregation_window_ms as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventAggregation {
    pub window_id: String,
    pub channel_id: String,
    /// In arrival order.
    pub events: Vec<StreamEvent>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub count: usize,
}

/// What one channel receives for one routed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Deliverable {
    Event(StreamEvent),
    Aggregation(EventAggregation),
}

impl Deliverable {
    pub fn is_aggregation(&self) -> bool {
        matches!(self, Deliverable::Aggregation(_))
    }

    pub fn event_count(&self) -> usize {
        match self {
            Deliverable::Event(_) => 1,
            Deliverable::Aggregation(aggregation) => aggregation.count,
        }
    }
}

#[derive(Debug)]
struct AggregationBuffer {
    window_id: String,
    window_start: DateTime<Utc>,
    events: Vec<StreamEvent>,
}

impl AggregationBuffer {
    fn new(window_start: DateTime<Utc>) -> Self {
        Self {
            window_id: Uuid::new_v4().to_string(),
            window_start,
            events: Vec::new(),
        }
    }

    fn into_aggregation(self, channel_id: &str, window_end: DateTime<Utc>) -> EventAggregation {
        EventAggregation {
            window_id: self.window_id,
            channel_id: channel_id.to_string(),
            count: self.events.len(),
            events: self.events,
            window_start: self.window_start,
            window_end,
        }
    }
}

#[derive(Debug)]
struct ChannelState {
    channel: Channel,
    buffer: Option<AggregationBuffer>,
}

impl ChannelState {
    fn flush(&mut self, window_end: DateTime<Utc>) -> Option<EventAggregation> {
        let buffer = self.buffer.take()?;
        if buffer.events.is_empty() {
            return None;
        }
        self.channel.metrics.aggregations_emitted += 1;
        Some(buffer.into_aggregation(&self.channel.id, window_end))
    }

    fn window_elapsed(&self, now: DateTime<Utc>) -> bool {
        match &self.buffer {
            Some(buffer) => now >= buffer.window_start + self.channel.window(),
            None => false,
        }
    }

    fn pending_events(&self) -> usize {
        self.buffer.as_ref().map(|b| b.events.len()).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub channel_id: String,
    pub channel_type: String,
    pub priority: Priority,
    pub aggregation_window_ms: u64,
    pub filters: usize,
    pub pending_events: usize,
    pub metrics: ChannelMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientChannelMetrics {
    pub client_id: String,
    pub channels: Vec<ChannelSummary>,
    pub total_events: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemChannelMetrics {
    /// Channels that routed an event within the configured active window.
    pub active_channels: usize,
    /// Open channels.
    pub total_channels: usize,
    pub total_clients: usize,
    /// Events routed by currently open channels.
    pub total_throughput: u64,
    /// Average routing latency weighted by events routed.
    pub average_latency_ms: f64,
    pub pending_aggregated_events: usize,
    pub channels_created: u64,
}

pub struct ChannelManager {
    config: ChannelsConfig,
    channels: DashMap<String, ChannelState>,
    /// Channel ids per client, in creation order.
    client_channels: DashMap<String, Vec<String>>,
    evaluator: ConditionEvaluator,
    channels_created: AtomicU64,
}

impl ChannelManager {
    pub fn new(config: ChannelsConfig, regex_size_limit: usize) -> Self {
        Self {
            config,
            channels: DashMap::new(),
            client_channels: DashMap::new(),
            evaluator: ConditionEvaluator::new(regex_size_limit),
            channels_created: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ChannelsConfig {
        &self.config
    }

    fn validate_filters(&self, filters: &[AdvancedFilter]) -> Result<()> {
        for filter in filters {
            self.evaluator.validate(filter)?;
        }
        Ok(())
    }

    /// Everything `create_channel` checks except the per-client limit.
    pub fn validate_config(&self, config: &ChannelConfig) -> Result<()> {
        if config.channel_type.is_empty() {
            return Err(StreamError::validation("Channel type cannot be empty"));
        }
        if config.aggregation_window_ms > self.config.max_aggregation_window_ms {
            return Err(StreamError::validation(format!(
                "Aggregation window {}ms exceeds maximum of {}ms",
                config.aggregation_window_ms, self.config.max_aggregation_window_ms
            )));
        }
        self.validate_filters(&config.filters)
    }

    pub fn client_channel_count(&self, client_id: &str) -> usize {
        self.client_channels.get(client_id).map(|owned| owned.len()).unwrap_or(0)
    }

    pub fn create_channel(&self, client_id: &str, config: ChannelConfig) -> Result<Channel> {
        if client_id.is_empty() {
            return Err(StreamError::validation("Client ID cannot be empty"));
        }
        self.validate_config(&config)?;

        let mut owned = self.client_channels.entry(client_id.to_string()).or_default();
        if owned.len() >= self.config.max_channels_per_client {
            return Err(StreamError::validation(format!(
                "Client {} already has the maximum of {} channels",
                client_id, self.config.max_channels_per_client
            )));
        }

        let channel = Channel {
            id: format!("ch_{}", Uuid::new_v4().simple()),
            client_id: client_id.to_string(),
            channel_type: config.channel_type,
            priority: config.priority,
            filters: config.filters,
            aggregation_window_ms: config.aggregation_window_ms,
            created_at: Utc::now(),
            metrics: ChannelMetrics::default(),
        };

        owned.push(channel.id.clone());
        self.channels.insert(
            channel.id.clone(),
            ChannelState {
                channel: channel.clone(),
                buffer: None,
            },
        );
        self.channels_created.fetch_add(1, Ordering::Relaxed);

        info!(
            "Created channel {} ({}) for client {} [priority={:?}, window={}ms, filters={}]",
            channel.id,
            channel.channel_type,
            client_id,
            channel.priority,
            channel.aggregation_window_ms,
            channel.filters.len()
        );
        Ok(channel)
    }

    /// Returns `false` if the channel does not exist (or was already closed).
    /// Events still pending in its aggregation buffer are discarded.
    pub fn close_channel(&self, channel_id: &str) -> bool {
        let Some((_, state)) = self.channels.remove(channel_id) else {
            return false;
        };

        let client_id = &state.channel.client_id;
        let now_empty = match self.client_channels.get_mut(client_id) {
            Some(mut owned) => {
                owned.retain(|id| id != channel_id);
                owned.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.client_channels.remove_if(client_id, |_, owned| owned.is_empty());
        }

        let pending = state.pending_events();
        if pending > 0 {
            debug!("Discarded {} pending events from closed channel {}", pending, channel_id);
        }
        info!("Closed channel {} for client {}", channel_id, client_id);
        true
    }

    pub fn close_client_channels(&self, client_id: &str) -> Vec<String> {
        let ids = self
            .client_channels
            .remove(client_id)
            .map(|(_, ids)| ids)
            .unwrap_or_default();

        for id in &ids {
            self.channels.remove(id);
        }
        if !ids.is_empty() {
            info!("Closed {} channels for client {}", ids.len(), client_id);
        }
        ids
    }

    /// Replace a channel's filters. Invalid filters are rejected without
    /// touching the channel; `Ok(false)` means the channel does not exist.
    pub fn update_channel_filters(&self, channel_id: &str, filters: Vec<AdvancedFilter>) -> Result<bool> {
        self.validate_filters(&filters)?;

        match self.channels.get_mut(channel_id) {
            Some(mut state) => {
                debug!("Updated {} filters on channel {}", filters.len(), channel_id);
                state.channel.filters = filters;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn get_channel(&self, channel_id: &str) -> Option<Channel> {
        self.channels.get(channel_id).map(|state| state.channel.clone())
    }

    pub fn channel_owner(&self, channel_id: &str) -> Option<String> {
        self.channels.get(channel_id).map(|state| state.channel.client_id.clone())
    }

    pub fn get_client_channels(&self, client_id: &str) -> Vec<Channel> {
        let ids = self
            .client_channels
            .get(client_id)
            .map(|owned| owned.clone())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.get_channel(id)).collect()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn process_event(&self, event: &StreamEvent) -> HashMap<String, Deliverable> {
        self.process_event_at(event, Utc::now())
    }

    /// Route one event to every open channel whose filters all match.
    ///
    /// Each affected channel gets at most one deliverable: the event itself,
    /// or an aggregation if this event closed (or filled) its window. A
    /// buffered event yields nothing for that channel until the flush.
    pub fn process_event_at(&self, event: &StreamEvent, now: DateTime<Utc>) -> HashMap<String, Deliverable> {
        let mut routed = HashMap::new();
        let view = match self.build_view(event) {
            Some(view) => view,
            None => return routed,
        };

        let latency_ms = (now - event.timestamp).num_milliseconds().max(0) as f64;

        for mut entry in self.channels.iter_mut() {
            let state = entry.value_mut();
            if !self.evaluator.matches_all(&state.channel.filters, &view, event) {
                continue;
            }

            let stamped = event.clone().with_channel(state.channel.id.clone());
            state.channel.metrics.record(latency_ms, now);

            if !state.channel.is_aggregating() {
                routed.insert(state.channel.id.clone(), Deliverable::Event(stamped));
                continue;
            }

            let mut flushed = None;
            if state.window_elapsed(now) {
                let window_end = state
                    .buffer
                    .as_ref()
                    .map(|b| b.window_start + state.channel.window())
                    .unwrap_or(now);
                flushed = state.flush(window_end);
            }

            let buffer = state.buffer.get_or_insert_with(|| AggregationBuffer::new(now));
            buffer.events.push(stamped);
            state.channel.metrics.events_aggregated += 1;

            if flushed.is_none() && buffer.events.len() >= self.config.max_events_per_window {
                debug!("Aggregation buffer full on channel {}, flushing early", state.channel.id);
                flushed = state.flush(now);
            }

            if let Some(aggregation) = flushed {
                routed.insert(state.channel.id.clone(), Deliverable::Aggregation(aggregation));
            }
        }

        debug!(
            "Routed event {} ({}) to {} channels",
            event.metadata.correlation_id,
            event.event_type(),
            routed.len()
        );
        routed
    }

    fn build_view(&self, event: &StreamEvent) -> Option<Value> {
        match event.field_view() {
            Ok(view) => Some(view),
            Err(e) => {
                debug!("Event {} could not be viewed for routing: {}", event.metadata.correlation_id, e);
                None
            }
        }
    }

    /// Flush every buffer whose window has elapsed. Periodic sweep entry point.
    pub fn flush_expired(&self, now: DateTime<Utc>) -> Vec<EventAggregation> {
        let mut flushed = Vec::new();
        for mut entry in self.channels.iter_mut() {
            let state = entry.value_mut();
            if !state.window_elapsed(now) {
                continue;
            }
            let window_end = state
                .buffer
                .as_ref()
                .map(|b| b.window_start + state.channel.window())
                .unwrap_or(now);
            if let Some(aggregation) = state.flush(window_end) {
                flushed.push(aggregation);
            }
        }
        if !flushed.is_empty() {
            debug!("Flushed {} expired aggregation windows", flushed.len());
        }
        flushed
    }

    pub fn get_client_metrics(&self, client_id: &str) -> ClientChannelMetrics {
        let ids = self
            .client_channels
            .get(client_id)
            .map(|owned| owned.clone())
            .unwrap_or_default();

        let channels: Vec<ChannelSummary> = ids
            .iter()
            .filter_map(|id| {
                self.channels.get(id).map(|state| ChannelSummary {
                    channel_id: state.channel.id.clone(),
                    channel_type: state.channel.channel_type.clone(),
                    priority: state.channel.priority,
                    aggregation_window_ms: state.channel.aggregation_window_ms,
                    filters: state.channel.filters.len(),
                    pending_events: state.pending_events(),
                    metrics: state.channel.metrics.clone(),
                })
            })
            .collect();

        ClientChannelMetrics {
            client_id: client_id.to_string(),
            total_events: channels.iter().map(|c| c.metrics.events_routed).sum(),
            channels,
        }
    }

    pub fn get_system_metrics(&self) -> SystemChannelMetrics {
        self.get_system_metrics_at(Utc::now())
    }

    /// Derived from the channel metrics on every call.
    pub fn get_system_metrics_at(&self, now: DateTime<Utc>) -> SystemChannelMetrics {
        let active_cutoff = now - Duration::milliseconds(self.config.active_window_ms as i64);
        let mut active_channels = 0;
        let mut total_throughput = 0u64;
        let mut weighted_latency = 0.0;
        let mut pending = 0;

        for entry in self.channels.iter() {
            let metrics = &entry.channel.metrics;
            if metrics.last_event_at.map(|t| t >= active_cutoff).unwrap_or(false) {
                active_channels += 1;
            }
            total_throughput += metrics.events_routed;
            weighted_latency += metrics.average_latency_ms * metrics.events_routed as f64;
            pending += entry.pending_events();
        }

        SystemChannelMetrics {
            active_channels,
            total_channels: self.channels.len(),
            total_clients: self.client_channels.len(),
            total_throughput,
            average_latency_ms: if total_throughput > 0 {
                weighted_latency / total_throughput as f64
            } else {
                0.0
            },
            pending_aggregated_events: pending,
            channels_created: self.channels_created.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::{ConditionOperator, FilterCondition};
    use crate::models::fixtures::*;
    use crate::models::Severity;
    use serde_json::json;

    fn manager() -> ChannelManager {
        ChannelManager::new(ChannelsConfig::default(), 1 << 20)
    }

    #[test]
    fn test_conjunctive_routing() {
        let manager = manager();
        let threats = manager
            .create_channel(
                "c1",
                ChannelConfig::new("threats").with_filters(vec![
                    FilterCondition::equals("type", "threat"),
                    FilterCondition::new("severity", ConditionOperator::GreaterThan, Some(json!("medium"))),
                ]),
            )
            .unwrap();
        let everything = manager.create_channel("c2", ChannelConfig::new("all")).unwrap();

        let routed = manager.process_event(&threat(Severity::High));
        assert_eq!(routed.len(), 2);
        match &routed[&threats.id] {
            Deliverable::Event(event) => assert_eq!(event.metadata.channel_id.as_deref(), Some(threats.id.as_str())),
            other => panic!("unexpected deliverable {:?}", other),
        }

        let routed = manager.process_event(&threat(Severity::Low));
        assert_eq!(routed.len(), 1);
        assert!(routed.contains_key(&everything.id));
    }

    #[test]
    fn test_channel_ids_are_unique() {
        let manager = manager();
        let a = manager.create_channel("c1", ChannelConfig::new("all")).unwrap();
        let b = manager.create_channel("c1", ChannelConfig::new("all")).unwrap();
        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("ch_"));
    }

    #[test]
    fn test_close_channel_twice() {
        let manager = manager();
        let channel = manager.create_channel("c1", ChannelConfig::new("all")).unwrap();

        assert!(manager.close_channel(&channel.id));
        assert!(!manager.close_channel(&channel.id));
        assert!(manager.get_client_metrics("c1").channels.is_empty());
        assert!(manager.process_event(&network(1)).is_empty());
    }

    #[test]
    fn test_lazy_window_flush_preserves_order() {
        let manager = manager();
        let channel = manager
            .create_channel("c1", ChannelConfig::new("batched").with_aggregation(30_000))
            .unwrap();
        let t0 = Utc::now();

        let events: Vec<StreamEvent> = (0..3).map(|i| network(i)).collect();
        for (i, event) in events.iter().enumerate() {
            let routed = manager.process_event_at(event, t0 + Duration::seconds(i as i64 * 10));
            assert!(routed.is_empty());
        }

        let late = network(99);
        let routed = manager.process_event_at(&late, t0 + Duration::seconds(31));
        let aggregation = match &routed[&channel.id] {
            Deliverable::Aggregation(aggregation) => aggregation.clone(),
            other => panic!("unexpected deliverable {:?}", other),
        };

        assert_eq!(aggregation.count, 3);
        assert_eq!(aggregation.window_start, t0);
        assert_eq!(aggregation.window_end, t0 + Duration::seconds(30));
        let correlation_ids: Vec<&str> = aggregation
            .events
            .iter()
            .map(|e| e.metadata.correlation_id.as_str())
            .collect();
        let expected: Vec<&str> = events.iter().map(|e| e.metadata.correlation_id.as_str()).collect();
        assert_eq!(correlation_ids, expected);

        // the late event opened the next window
        assert_eq!(manager.get_client_metrics("c1").channels[0].pending_events, 1);
    }

    #[test]
    fn test_sweep_flushes_expired_windows() {
        let manager = manager();
        manager
            .create_channel("c1", ChannelConfig::new("batched").with_aggregation(1_000))
            .unwrap();
        let t0 = Utc::now();
        manager.process_event_at(&network(1), t0);

        assert!(manager.flush_expired(t0 + Duration::milliseconds(500)).is_empty());
        let flushed = manager.flush_expired(t0 + Duration::milliseconds(1_000));
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].count, 1);
        assert!(manager.flush_expired(t0 + Duration::seconds(10)).is_empty());
    }

    #[test]
    fn test_full_buffer_flushes_early() {
        let config = ChannelsConfig {
            max_events_per_window: 2,
            ..Default::default()
        };
        let manager = ChannelManager::new(config, 1 << 20);
        let channel = manager
            .create_channel("c1", ChannelConfig::new("batched").with_aggregation(60_000))
            .unwrap();
        let t0 = Utc::now();

        assert!(manager.process_event_at(&network(1), t0).is_empty());
        let routed = manager.process_event_at(&network(2), t0);
        assert!(routed[&channel.id].is_aggregation());
        assert_eq!(routed[&channel.id].event_count(), 2);
    }

    #[test]
    fn test_invalid_config_is_rejected_whole() {
        let manager = manager();
        let channel = manager.create_channel("c1", ChannelConfig::new("all")).unwrap();

        let bad = vec![
            FilterCondition::equals("type", "threat"),
            FilterCondition::equals("data.bogus", 1),
        ];
        assert!(manager.create_channel("c1", ChannelConfig::new("x").with_filters(bad.clone())).is_err());
        assert!(manager.update_channel_filters(&channel.id, bad).is_err());
        assert!(manager.get_channel(&channel.id).unwrap().filters.is_empty());

        assert!(manager
            .create_channel("c1", ChannelConfig::new("x").with_aggregation(10_000_000))
            .is_err());
        assert_eq!(manager.update_channel_filters("ch_missing", vec![]).unwrap(), false);
    }

    #[test]
    fn test_per_client_channel_limit() {
        let config = ChannelsConfig {
            max_channels_per_client: 2,
            ..Default::default()
        };
        let manager = ChannelManager::new(config, 1 << 20);
        manager.create_channel("c1", ChannelConfig::new("a")).unwrap();
        manager.create_channel("c1", ChannelConfig::new("b")).unwrap();
        assert!(manager.create_channel("c1", ChannelConfig::new("c")).is_err());
        assert!(manager.create_channel("c2", ChannelConfig::new("a")).is_ok());
    }

    #[test]
    fn test_metrics_are_derived() {
        let manager = manager();
        manager.create_channel("c1", ChannelConfig::new("all")).unwrap();
        manager.create_channel("c2", ChannelConfig::new("all")).unwrap();
        let idle = manager
            .create_channel("c2", ChannelConfig::new("none").with_filters(vec![FilterCondition::equals("type", "intelligence")]))
            .unwrap();

        let now = Utc::now();
        let event = network(1).with_timestamp(now - Duration::milliseconds(40));
        manager.process_event_at(&event, now);

        let system = manager.get_system_metrics_at(now);
        assert_eq!(system.total_channels, 3);
        assert_eq!(system.active_channels, 2);
        assert_eq!(system.total_clients, 2);
        assert_eq!(system.total_throughput, 2);
        assert!((system.average_latency_ms - 40.0).abs() < 1e-9);

        let client = manager.get_client_metrics("c2");
        assert_eq!(client.channels.len(), 2);
        assert_eq!(client.total_events, 1);

        assert_eq!(manager.close_client_channels("c2").len(), 2);
        assert!(manager.get_channel(&idle.id).is_none());
        assert_eq!(manager.get_system_metrics_at(now).total_channels, 1);
    }
}
