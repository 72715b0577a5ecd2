//! Per-client session state owned by the orchestrator: identity, the
//! client-level event filter and the admission rate limiter.

use chrono::{DateTime, Utc};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;

use crate::models::{ClientType, EventType, Severity, StreamEvent};
use crate::protocol::ClientFilterUpdate;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Coarse per-client filter applied before the smart filtering engine.
/// Empty lists mean "any".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnhancedClientFilter {
    #[serde(default)]
    pub event_types: Vec<EventType>,
    #[serde(default)]
    pub min_severity: Severity,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub required_tags: Vec<String>,
}

impl EnhancedClientFilter {
    pub fn matches(&self, event: &StreamEvent) -> bool {
        if !self.event_types.is_empty() && !self.event_types.contains(&event.event_type()) {
            return false;
        }
        if event.severity() < self.min_severity {
            return false;
        }
        if !self.sources.is_empty()
            && !self
                .sources
                .iter()
                .any(|s| s.eq_ignore_ascii_case(&event.metadata.source))
        {
            return false;
        }
        self.required_tags
            .iter()
            .all(|tag| event.metadata.tags.iter().any(|t| t == tag))
    }

    pub fn merge(&mut self, update: ClientFilterUpdate) {
        if let Some(event_types) = update.event_types {
            self.event_types = event_types;
        }
        if let Some(min_severity) = update.min_severity {
            self.min_severity = min_severity;
        }
        if let Some(sources) = update.sources {
            self.sources = sources;
        }
        if let Some(required_tags) = update.required_tags {
            self.required_tags = required_tags;
        }
    }
}

pub struct ClientSession {
    pub client_id: String,
    pub user_id: Option<String>,
    pub client_type: ClientType,
    pub connected_at: DateTime<Utc>,
    pub default_channel_id: String,
    pub filter: EnhancedClientFilter,
    limiter: DirectLimiter,
    limiter_rate: u32,
    delivery_error_rate: f64,
}

/// Smoothing factor for the delivery error rate.
const ERROR_RATE_ALPHA: f64 = 0.1;

impl ClientSession {
    pub fn new(
        client_id: impl Into<String>,
        user_id: Option<String>,
        client_type: ClientType,
        default_channel_id: impl Into<String>,
        initial_rate: u32,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            user_id,
            client_type,
            connected_at: Utc::now(),
            default_channel_id: default_channel_id.into(),
            filter: EnhancedClientFilter::default(),
            limiter: build_limiter(initial_rate),
            limiter_rate: initial_rate.max(1),
            delivery_error_rate: 0.0,
        }
    }

    /// Key under which this client's smart-filter preferences are stored.
    pub fn preference_key(&self) -> &str {
        self.user_id.as_deref().unwrap_or(&self.client_id)
    }

    pub fn admission_rate(&self) -> u32 {
        self.limiter_rate
    }

    /// Resize the limiter when the recommended rate changes. Returns whether
    /// it was rebuilt.
    pub fn apply_rate(&mut self, rate: u32) -> bool {
        let rate = rate.max(1);
        if rate == self.limiter_rate {
            return false;
        }
        self.limiter = build_limiter(rate);
        self.limiter_rate = rate;
        true
    }

    /// Fold one delivery outcome into the smoothed error rate (percent).
    pub fn record_delivery(&mut self, success: bool) -> f64 {
        let sample = if success { 0.0 } else { 100.0 };
        self.delivery_error_rate += ERROR_RATE_ALPHA * (sample - self.delivery_error_rate);
        self.delivery_error_rate
    }

    pub fn delivery_error_rate(&self) -> f64 {
        self.delivery_error_rate
    }

    /// Take one slot from the admission budget.
    pub fn try_admit(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

fn build_limiter(rate: u32) -> DirectLimiter {
    let per_second = NonZeroU32::new(rate).unwrap_or(NonZeroU32::MIN);
    RateLimiter::direct(Quota::per_second(per_second))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::*;

    #[test]
    fn test_default_filter_is_permissive() {
        let filter = EnhancedClientFilter::default();
        assert!(filter.matches(&system(Severity::Info, "ok")));
        assert!(filter.matches(&threat(Severity::Critical)));
    }

    #[test]
    fn test_filter_fields() {
        let filter = EnhancedClientFilter {
            event_types: vec![EventType::Threat],
            min_severity: Severity::Medium,
            sources: vec!["EDR".to_string()],
            required_tags: vec!["apt".to_string()],
        };

        assert!(!filter.matches(&threat(Severity::High)));
        assert!(filter.matches(&threat(Severity::High).with_tags(["apt"])));
        assert!(!filter.matches(&threat(Severity::Low).with_tags(["apt"])));
        assert!(!filter.matches(&network(10).with_tags(["apt"])));
    }

    #[test]
    fn test_merge_keeps_unset_fields() {
        let mut filter = EnhancedClientFilter {
            min_severity: Severity::High,
            ..Default::default()
        };
        filter.merge(ClientFilterUpdate {
            event_types: Some(vec![EventType::Network]),
            ..Default::default()
        });

        assert_eq!(filter.min_severity, Severity::High);
        assert_eq!(filter.event_types, vec![EventType::Network]);
    }

    #[test]
    fn test_limiter_budget_and_resize() {
        let mut session = ClientSession::new("c1", None, ClientType::Web, "ch_1", 2);
        assert!(session.try_admit());
        assert!(session.try_admit());
        assert!(!session.try_admit());

        assert!(!session.apply_rate(2));
        assert!(session.apply_rate(5));
        assert_eq!(session.admission_rate(), 5);
        assert!(session.try_admit());
        assert_eq!(session.preference_key(), "c1");
    }

    #[test]
    fn test_delivery_error_rate_is_smoothed() {
        let mut session = ClientSession::new("c1", Some("alice".to_string()), ClientType::Api, "ch_1", 10);
        assert_eq!(session.record_delivery(false), 10.0);
        assert!((session.record_delivery(true) - 9.0).abs() < 1e-9);
        assert_eq!(session.preference_key(), "alice");
    }
}
