//! Adaptive Throttling Engine - per-client capacity tracking and admission-rate
//! recommendations.
//!
//! Each client keeps its current metrics plus a trailing window of snapshots.
//! Latency and error rate are averaged over the window; queue depth is taken
//! from the current metrics since it is instantaneous backpressure. Each of
//! the three signals is classified against its own four-tier thresholds and
//! the most severe tier wins.
//!
//! Without hysteresis (`hysteresis_readings = 0`, the default) the level is
//! re-derived from scratch on every update, so a client hovering at a
//! threshold boundary can oscillate between adjacent levels.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ThresholdTiers, ThrottlingConfig};
use crate::models::ClientType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleLevel {
    None,
    Light,
    Moderate,
    Heavy,
    Critical,
}

impl ThrottleLevel {
    /// Base rate factor as a percentage of the maximum rate.
    pub fn base_factor_percent(&self) -> u64 {
        match self {
            ThrottleLevel::None => 100,
            ThrottleLevel::Light => 80,
            ThrottleLevel::Moderate => 60,
            ThrottleLevel::Heavy => 40,
            ThrottleLevel::Critical => 20,
        }
    }

    /// Degraded clients are re-evaluated sooner.
    pub fn time_to_recheck_ms(&self) -> u64 {
        match self {
            ThrottleLevel::None => 60_000,
            ThrottleLevel::Light => 30_000,
            ThrottleLevel::Moderate => 15_000,
            ThrottleLevel::Heavy => 10_000,
            ThrottleLevel::Critical => 5_000,
        }
    }

    pub fn classify(value: f64, tiers: &ThresholdTiers) -> Self {
        if value > tiers.critical {
            ThrottleLevel::Critical
        } else if value > tiers.heavy {
            ThrottleLevel::Heavy
        } else if value > tiers.moderate {
            ThrottleLevel::Moderate
        } else if value > tiers.light {
            ThrottleLevel::Light
        } else {
            ThrottleLevel::None
        }
    }
}

impl fmt::Display for ThrottleLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ThrottleLevel::None => "none",
            ThrottleLevel::Light => "light",
            ThrottleLevel::Moderate => "moderate",
            ThrottleLevel::Heavy => "heavy",
            ThrottleLevel::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// Assumed consumption capacity per client type, in tenths.
pub fn client_type_multiplier_tenths(client_type: ClientType) -> u64 {
    match client_type {
        ClientType::Cli => 12,
        ClientType::Web => 10,
        ClientType::Api => 15,
        ClientType::Mobile => 7,
    }
}

/// `max(1, floor(max_rate * base_factor * multiplier))`, computed in integers
/// so the floor is exact.
pub fn recommended_rate(max_rate: u32, level: ThrottleLevel, client_type: ClientType) -> u32 {
    let scaled = max_rate as u64 * level.base_factor_percent() * client_type_multiplier_tenths(client_type) / 1000;
    scaled.clamp(1, u32::MAX as u64) as u32
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientCapacityMetrics {
    /// Milliseconds.
    pub connection_latency: f64,
    /// Messages per second.
    pub message_processing_rate: f64,
    /// Percent.
    pub error_rate: f64,
    pub queue_depth: u64,
    pub last_activity_time: DateTime<Utc>,
    pub client_type: ClientType,
    /// Bytes per second.
    pub bandwidth_estimate: f64,
}

impl ClientCapacityMetrics {
    fn new(client_type: ClientType, now: DateTime<Utc>) -> Self {
        Self {
            connection_latency: 0.0,
            message_processing_rate: 0.0,
            error_rate: 0.0,
            queue_depth: 0,
            last_activity_time: now,
            client_type,
            bandwidth_estimate: 0.0,
        }
    }
}

/// Partial metrics; only the fields that are set are merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsUpdate {
    pub connection_latency: Option<f64>,
    pub message_processing_rate: Option<f64>,
    pub error_rate: Option<f64>,
    pub queue_depth: Option<u64>,
    pub client_type: Option<ClientType>,
    pub bandwidth_estimate: Option<f64>,
}

impl MetricsUpdate {
    pub fn latency(ms: f64) -> Self {
        Self {
            connection_latency: Some(ms),
            ..Default::default()
        }
    }

    pub fn error_rate(percent: f64) -> Self {
        Self {
            error_rate: Some(percent),
            ..Default::default()
        }
    }

    pub fn queue_depth(depth: u64) -> Self {
        Self {
            queue_depth: Some(depth),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub connection_latency: f64,
    pub error_rate: f64,
    pub queue_depth: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleRecommendation {
    pub client_id: String,
    pub recommended_rate: u32,
    pub throttle_level: ThrottleLevel,
    pub reason: String,
    pub adjustment_factor: f64,
    /// Milliseconds until the recommendation should be recomputed.
    pub time_to_recheck: u64,
    pub computed_at: DateTime<Utc>,
}

impl ThrottleRecommendation {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.computed_at + Duration::milliseconds(self.time_to_recheck as i64)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ThrottlingStats {
    pub tracked_clients: usize,
    pub clients_by_level: Vec<(ThrottleLevel, usize)>,
    pub max_events_per_second: u32,
    pub adaptive_mode: bool,
}

#[derive(Debug)]
struct ClientThrottleState {
    metrics: ClientCapacityMetrics,
    window: VecDeque<MetricsSnapshot>,
    recommendation: Option<ThrottleRecommendation>,
    applied_level: ThrottleLevel,
    downgrade_streak: u32,
}

impl ClientThrottleState {
    fn new(client_type: ClientType, now: DateTime<Utc>) -> Self {
        Self {
            metrics: ClientCapacityMetrics::new(client_type, now),
            window: VecDeque::new(),
            recommendation: None,
            applied_level: ThrottleLevel::None,
            downgrade_streak: 0,
        }
    }

    fn prune(&mut self, now: DateTime<Utc>, window_size: Duration) {
        let cutoff = now - window_size;
        while let Some(front) = self.window.front() {
            if front.timestamp < cutoff {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }
}

pub struct AdaptiveThrottlingEngine {
    config: ThrottlingConfig,
    clients: DashMap<String, ClientThrottleState>,
}

impl AdaptiveThrottlingEngine {
    pub fn new(config: ThrottlingConfig) -> Self {
        info!(
            "Initializing adaptive throttling engine (max {} events/s, window {}ms, adaptive={})",
            config.max_events_per_second, config.window_size_ms, config.adaptive_mode
        );
        Self {
            config,
            clients: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ThrottlingConfig {
        &self.config
    }

    fn window_size(&self) -> Duration {
        Duration::milliseconds(self.config.window_size_ms as i64)
    }

    /// Start tracking a client without recording any metrics sample.
    pub fn register_client(&self, client_id: &str, client_type: ClientType) {
        let now = Utc::now();
        self.clients
            .entry(client_id.to_string())
            .and_modify(|state| state.metrics.client_type = client_type)
            .or_insert_with(|| ClientThrottleState::new(client_type, now));
    }

    pub fn update_metrics(&self, client_id: &str, update: MetricsUpdate) -> Option<ThrottleRecommendation> {
        self.update_metrics_at(client_id, update, Utc::now())
    }

    /// Merge partial metrics, append a window snapshot and, in adaptive mode,
    /// recompute the cached recommendation (which is returned).
    pub fn update_metrics_at(
        &self,
        client_id: &str,
        update: MetricsUpdate,
        now: DateTime<Utc>,
    ) -> Option<ThrottleRecommendation> {
        let window_size = self.window_size();
        let mut state = self
            .clients
            .entry(client_id.to_string())
            .or_insert_with(|| ClientThrottleState::new(update.client_type.unwrap_or_default(), now));

        let metrics = &mut state.metrics;
        if let Some(v) = update.connection_latency {
            metrics.connection_latency = v;
        }
        if let Some(v) = update.message_processing_rate {
            metrics.message_processing_rate = v;
        }
        if let Some(v) = update.error_rate {
            metrics.error_rate = v;
        }
        if let Some(v) = update.queue_depth {
            metrics.queue_depth = v;
        }
        if let Some(v) = update.client_type {
            metrics.client_type = v;
        }
        if let Some(v) = update.bandwidth_estimate {
            metrics.bandwidth_estimate = v;
        }
        metrics.last_activity_time = now;

        let snapshot = MetricsSnapshot {
            timestamp: now,
            connection_latency: metrics.connection_latency,
            error_rate: metrics.error_rate,
            queue_depth: metrics.queue_depth,
        };
        state.window.push_back(snapshot);
        state.prune(now, window_size);

        if !self.config.adaptive_mode {
            return None;
        }

        let recommendation = self.compute(client_id, &mut state, now);
        state.recommendation = Some(recommendation.clone());
        Some(recommendation)
    }

    pub fn get_recommendation(&self, client_id: &str) -> ThrottleRecommendation {
        self.get_recommendation_at(client_id, Utc::now())
    }

    /// Cached recommendation while its recheck deadline has not elapsed,
    /// otherwise a freshly computed one.
    pub fn get_recommendation_at(&self, client_id: &str, now: DateTime<Utc>) -> ThrottleRecommendation {
        let mut state = match self.clients.get_mut(client_id) {
            Some(state) => state,
            None => return self.optimistic_default(client_id, now),
        };

        if let Some(cached) = &state.recommendation {
            if cached.is_fresh(now) {
                return cached.clone();
            }
        }

        let window_size = self.window_size();
        state.prune(now, window_size);
        let recommendation = self.compute(client_id, &mut state, now);
        state.recommendation = Some(recommendation.clone());
        recommendation
    }

    fn optimistic_default(&self, client_id: &str, now: DateTime<Utc>) -> ThrottleRecommendation {
        ThrottleRecommendation {
            client_id: client_id.to_string(),
            recommended_rate: self.config.max_events_per_second,
            throttle_level: ThrottleLevel::None,
            reason: "No metrics recorded".to_string(),
            adjustment_factor: 1.0,
            time_to_recheck: ThrottleLevel::None.time_to_recheck_ms(),
            computed_at: now,
        }
    }

    fn compute(&self, client_id: &str, state: &mut ClientThrottleState, now: DateTime<Utc>) -> ThrottleRecommendation {
        if state.window.is_empty() {
            return self.optimistic_default(client_id, now);
        }

        let samples = state.window.len() as f64;
        let avg_latency = state.window.iter().map(|s| s.connection_latency).sum::<f64>() / samples;
        let avg_error_rate = state.window.iter().map(|s| s.error_rate).sum::<f64>() / samples;
        let queue_depth = state.metrics.queue_depth as f64;

        let signals = [
            ("latency", avg_latency, ThrottleLevel::classify(avg_latency, &self.config.latency_thresholds)),
            ("error rate", avg_error_rate, ThrottleLevel::classify(avg_error_rate, &self.config.error_rate_thresholds)),
            ("queue depth", queue_depth, ThrottleLevel::classify(queue_depth, &self.config.queue_depth_thresholds)),
        ];

        let raw_level = signals.iter().map(|(_, _, level)| *level).max().unwrap_or(ThrottleLevel::None);
        let level = self.apply_hysteresis(state, raw_level);

        if level != state.applied_level {
            log_transition(client_id, state.applied_level, level);
            state.applied_level = level;
        }

        let triggered: Vec<String> = signals
            .iter()
            .filter(|(_, _, l)| *l > ThrottleLevel::None)
            .map(|(name, value, l)| format!("{} {:.1} ({})", name, value, l))
            .collect();
        let mut reason = if triggered.is_empty() {
            "All signals within thresholds".to_string()
        } else {
            triggered.join("; ")
        };
        if level != raw_level {
            reason.push_str(&format!("; holding {} until downgrade is confirmed", level));
        }

        let client_type = state.metrics.client_type;
        let factor_thousandths = level.base_factor_percent() * client_type_multiplier_tenths(client_type);

        ThrottleRecommendation {
            client_id: client_id.to_string(),
            recommended_rate: recommended_rate(self.config.max_events_per_second, level, client_type),
            throttle_level: level,
            reason,
            adjustment_factor: factor_thousandths as f64 / 1000.0,
            time_to_recheck: level.time_to_recheck_ms(),
            computed_at: now,
        }
    }

    /// Escalation applies immediately; a downgrade waits for
    /// `hysteresis_readings` consecutive less-severe readings.
    fn apply_hysteresis(&self, state: &mut ClientThrottleState, raw_level: ThrottleLevel) -> ThrottleLevel {
        let required = self.config.hysteresis_readings;
        if required == 0 || raw_level >= state.applied_level {
            state.downgrade_streak = 0;
            return raw_level;
        }

        state.downgrade_streak += 1;
        if state.downgrade_streak >= required {
            state.downgrade_streak = 0;
            raw_level
        } else {
            state.applied_level
        }
    }

    pub fn get_client_metrics(&self, client_id: &str) -> Option<ClientCapacityMetrics> {
        self.clients.get(client_id).map(|state| state.metrics.clone())
    }

    pub fn metrics_window(&self, client_id: &str) -> Vec<MetricsSnapshot> {
        self.clients
            .get(client_id)
            .map(|state| state.window.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_tracked(&self, client_id: &str) -> bool {
        self.clients.contains_key(client_id)
    }

    pub fn tracked_clients(&self) -> usize {
        self.clients.len()
    }

    /// Drop metrics, window and cached recommendation for one client together.
    pub fn remove_client(&self, client_id: &str) -> bool {
        self.clients.remove(client_id).is_some()
    }

    pub fn prune_windows(&self, now: DateTime<Utc>) {
        let window_size = self.window_size();
        for mut entry in self.clients.iter_mut() {
            entry.value_mut().prune(now, window_size);
        }
    }

    /// Evict clients whose last activity is older than the inactivity timeout.
    pub fn evict_inactive(&self, now: DateTime<Utc>) -> Vec<String> {
        let cutoff = now - Duration::milliseconds(self.config.inactivity_timeout_ms as i64);
        let candidates: Vec<String> = self
            .clients
            .iter()
            .filter(|entry| entry.metrics.last_activity_time < cutoff)
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = Vec::new();
        for client_id in candidates {
            // Re-check under the entry lock: the client may have reported since.
            if self
                .clients
                .remove_if(&client_id, |_, state| state.metrics.last_activity_time < cutoff)
                .is_some()
            {
                evicted.push(client_id);
            }
        }

        if !evicted.is_empty() {
            info!("Evicted {} inactive clients from throttling state", evicted.len());
        }
        evicted
    }

    pub fn get_stats(&self) -> ThrottlingStats {
        let mut counts = [0usize; 5];
        for entry in self.clients.iter() {
            counts[entry.applied_level as usize] += 1;
        }
        let levels = [
            ThrottleLevel::None,
            ThrottleLevel::Light,
            ThrottleLevel::Moderate,
            ThrottleLevel::Heavy,
            ThrottleLevel::Critical,
        ];

        ThrottlingStats {
            tracked_clients: self.clients.len(),
            clients_by_level: levels.iter().copied().zip(counts).collect(),
            max_events_per_second: self.config.max_events_per_second,
            adaptive_mode: self.config.adaptive_mode,
        }
    }

    /// Periodic window pruning and inactive-client eviction.
    pub fn spawn_maintenance(engine: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = std::time::Duration::from_millis(engine.config.cleanup_interval_ms.max(1));
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Throttling maintenance task stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let now = Utc::now();
                        engine.prune_windows(now);
                        engine.evict_inactive(now);
                    }
                }
            }
        })
    }
}

fn log_transition(client_id: &str, old: ThrottleLevel, new: ThrottleLevel) {
    if new > old {
        warn!("Client {} throttle level {} -> {}", client_id, old, new);
    } else {
        info!("Client {} throttle level {} -> {}", client_id, old, new);
    }
}
