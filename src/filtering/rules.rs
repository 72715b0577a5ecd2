use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;

use crate::conditions::{ConditionOperator, FilterCondition};
use crate::models::Priority;

/// What a matching rule does to the event, applied in declared order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterAction {
    /// Stop evaluation and drop the event.
    Block,
    Allow,
    Modify {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        priority: Option<Priority>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        relevance_score: Option<f64>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        attributes: HashMap<String, Value>,
    },
    Tag {
        tags: Vec<String>,
    },
    Route {
        channel_id: String,
    },
    Aggregate,
    /// Side-channel notification; never changes the delivery decision.
    Alert {
        message: String,
    },
}

impl FilterAction {
    pub fn name(&self) -> &'static str {
        match self {
            FilterAction::Block => "block",
            FilterAction::Allow => "allow",
            FilterAction::Modify { .. } => "modify",
            FilterAction::Tag { .. } => "tag",
            FilterAction::Route { .. } => "route",
            FilterAction::Aggregate => "aggregate",
            FilterAction::Alert { .. } => "alert",
        }
    }
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmartFilterRule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Higher values are evaluated first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub conditions: Vec<FilterCondition>,
    pub actions: Vec<FilterAction>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl SmartFilterRule {
    pub fn new(id: impl Into<String>, name: impl Into<String>, priority: i32) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            enabled: true,
            priority,
            conditions: Vec::new(),
            actions: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_condition(mut self, condition: FilterCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_action(mut self, action: FilterAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn total_weight(&self) -> f64 {
        self.conditions.iter().map(FilterCondition::effective_weight).sum()
    }
}

/// Per-rule counters. Only ever incremented; dropped together with the rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleStatistics {
    pub events_processed: u64,
    pub events_matched: u64,
    pub events_filtered: u64,
    pub last_triggered: Option<DateTime<Utc>>,
}

/// Rules installed at start-up unless disabled in configuration.
pub fn default_rules() -> Vec<SmartFilterRule> {
    vec![
        SmartFilterRule::new("suppress_system_noise", "Suppress System Noise", 100)
            .with_description("Drop informational collector heartbeats")
            .with_condition(FilterCondition::equals("severity", "info"))
            .with_condition(FilterCondition::new(
                "data.message",
                ConditionOperator::Regex,
                Some(json!(r"heartbeat|keep-?alive")),
            ))
            .with_action(FilterAction::Block),
        SmartFilterRule::new("tag_critical_threats", "Tag Critical Threats", 90)
            .with_description("Escalate critical threat detections")
            .with_condition(FilterCondition::equals("type", "threat"))
            .with_condition(FilterCondition::equals("severity", "critical"))
            .with_action(FilterAction::Tag {
                tags: vec!["critical-threat".to_string()],
            })
            .with_action(FilterAction::Modify {
                priority: Some(Priority::Critical),
                relevance_score: None,
                attributes: HashMap::new(),
            }),
        SmartFilterRule::new("alert_high_confidence", "Alert On High-Confidence Threats", 80)
            .with_description("Raise an alert for threat detections above 0.9 confidence")
            .with_condition(FilterCondition::equals("type", "threat"))
            .with_condition(FilterCondition::new(
                "data.confidence",
                ConditionOperator::GreaterThan,
                Some(json!(0.9)),
            ))
            .with_action(FilterAction::Alert {
                message: "High-confidence threat detected".to_string(),
            }),
    ]
}
