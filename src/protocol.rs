//! Control commands accepted from clients and messages sent back to them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::channels::{ChannelConfig, EventAggregation};
use crate::conditions::AdvancedFilter;
use crate::error::StreamError;
use crate::filtering::{FilterDecision, UserFilterPreferences};
use crate::models::{EventType, Severity, StreamEvent};
use crate::throttling::{MetricsUpdate, ThrottleRecommendation};

fn default_replace_existing() -> bool {
    true
}

/// Full stream setup for one client, applied all-or-nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientStreamConfig {
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<ClientFilterUpdate>,
    /// Close the client's current channels before creating these.
    #[serde(default = "default_replace_existing")]
    pub replace_existing: bool,
}

/// Partial update of a client's `EnhancedClientFilter`; unset fields are kept.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientFilterUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_types: Option<Vec<EventType>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlCommand {
    ConfigureStreams {
        config: ClientStreamConfig,
    },
    UpdateFilters {
        filter: ClientFilterUpdate,
    },
    UpdateChannelFilters {
        channel_id: String,
        filters: Vec<AdvancedFilter>,
    },
    CreateChannel {
        config: ChannelConfig,
    },
    CloseChannel {
        channel_id: String,
    },
    /// Optionally carries client-reported counters folded in before the
    /// recommendation is recomputed.
    RequestThrottleAdjustment {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metrics: Option<MetricsUpdate>,
    },
    UpdateSmartFilters {
        preferences: UserFilterPreferences,
    },
    GetStreamMetrics,
    GetFilteringStats,
}

impl ControlCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ControlCommand::ConfigureStreams { .. } => "configure_streams",
            ControlCommand::UpdateFilters { .. } => "update_filters",
            ControlCommand::UpdateChannelFilters { .. } => "update_channel_filters",
            ControlCommand::CreateChannel { .. } => "create_channel",
            ControlCommand::CloseChannel { .. } => "close_channel",
            ControlCommand::RequestThrottleAdjustment { .. } => "request_throttle_adjustment",
            ControlCommand::UpdateSmartFilters { .. } => "update_smart_filters",
            ControlCommand::GetStreamMetrics => "get_stream_metrics",
            ControlCommand::GetFilteringStats => "get_filtering_stats",
        }
    }
}

/// Reply to every control command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl CommandResult {
    pub fn ok(command: &str, data: Value) -> Self {
        Self {
            command: command.to_string(),
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// An operation that ran but had nothing to act on, e.g. closing an
    /// unknown channel.
    pub fn unsuccessful(command: &str, data: Value) -> Self {
        Self {
            command: command.to_string(),
            success: false,
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(command: &str, error: &StreamError) -> Self {
        let mut payload = error.to_payload();
        Self {
            command: command.to_string(),
            success: false,
            data: None,
            error: Some(payload["error"].take()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSummary {
    pub action: FilterDecision,
    pub score: f64,
    pub matched_rules: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Welcome {
        client_id: String,
        default_channel_id: String,
        server_time: DateTime<Utc>,
        throttle: ThrottleRecommendation,
    },
    Event {
        channel_id: String,
        event: StreamEvent,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<FilterSummary>,
    },
    Aggregation {
        channel_id: String,
        aggregation: EventAggregation,
    },
    CommandResult(CommandResult),
    SystemMetrics {
        metrics: Value,
    },
    ThrottleUpdate {
        recommendation: ThrottleRecommendation,
    },
}

impl OutboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::Welcome { .. } => "welcome",
            OutboundMessage::Event { .. } => "event",
            OutboundMessage::Aggregation { .. } => "aggregation",
            OutboundMessage::CommandResult(_) => "command_result",
            OutboundMessage::SystemMetrics { .. } => "system_metrics",
            OutboundMessage::ThrottleUpdate { .. } => "throttle_update",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_wire_format() {
        let command: ControlCommand = serde_json::from_value(json!({
            "type": "create_channel",
            "config": {
                "channel_type": "threats",
                "priority": "high",
                "filters": [{"field": "type", "operator": "equals", "value": "threat"}],
                "aggregation_window_ms": 5000
            }
        }))
        .unwrap();

        match &command {
            ControlCommand::CreateChannel { config } => {
                assert_eq!(config.filters.len(), 1);
                assert_eq!(config.aggregation_window_ms, 5000);
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(command.name(), "create_channel");

        let unit: ControlCommand = serde_json::from_value(json!({"type": "get_stream_metrics"})).unwrap();
        assert_eq!(unit, ControlCommand::GetStreamMetrics);

        let adjust: ControlCommand =
            serde_json::from_value(json!({"type": "request_throttle_adjustment"})).unwrap();
        assert_eq!(adjust, ControlCommand::RequestThrottleAdjustment { metrics: None });
    }

    #[test]
    fn test_configure_streams_defaults() {
        let command: ControlCommand = serde_json::from_value(json!({
            "type": "configure_streams",
            "config": {"channels": [{}]}
        }))
        .unwrap();

        let ControlCommand::ConfigureStreams { config } = command else {
            panic!("expected configure_streams");
        };
        assert!(config.replace_existing);
        assert_eq!(config.channels[0].channel_type, "all");
    }

    #[test]
    fn test_command_result_error_payload() {
        let result = CommandResult::failed("close_channel", &StreamError::permission("not yours"));
        let json = serde_json::to_value(OutboundMessage::CommandResult(result)).unwrap();

        assert_eq!(json["type"], "command_result");
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["code"], "PERMISSION_DENIED");
        assert!(json.get("data").is_none());
    }
}
