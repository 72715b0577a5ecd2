use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Result, StreamError};
use crate::models::{EventType, Severity, StreamEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoiseLevel {
    Low,
    Medium,
    High,
}

impl NoiseLevel {
    /// Scale applied to the heuristic noise penalty.
    pub fn factor(&self) -> f64 {
        match self {
            NoiseLevel::Low => 0.5,
            NoiseLevel::Medium => 1.0,
            NoiseLevel::High => 2.0,
        }
    }
}

impl Default for NoiseLevel {
    fn default() -> Self {
        NoiseLevel::Medium
    }
}

fn default_enabled() -> bool {
    true
}

fn default_type_priority() -> u8 {
    5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventTypePreference {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 1 (least interesting) to 10; 5 is neutral.
    #[serde(default = "default_type_priority")]
    pub priority: u8,
}

impl Default for EventTypePreference {
    fn default() -> Self {
        Self {
            enabled: true,
            priority: default_type_priority(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NoiseReduction {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub level: NoiseLevel,
}

fn default_grouping_window_ms() -> u64 {
    60_000
}

fn default_similarity_threshold() -> f64 {
    0.8
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntelligentGrouping {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_grouping_window_ms")]
    pub time_window_ms: u64,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
}

impl Default for IntelligentGrouping {
    fn default() -> Self {
        Self {
            enabled: false,
            time_window_ms: default_grouping_window_ms(),
            similarity_threshold: default_similarity_threshold(),
        }
    }
}

/// Per-user filtering preferences, applied as a hard gate before any rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserFilterPreferences {
    #[serde(default)]
    pub severity_minimum: Severity,
    #[serde(default)]
    pub event_type_preferences: HashMap<EventType, EventTypePreference>,
    #[serde(default)]
    pub noise_reduction: NoiseReduction,
    #[serde(default)]
    pub intelligent_grouping: IntelligentGrouping,
}

impl UserFilterPreferences {
    pub fn validate(&self) -> Result<()> {
        for (event_type, preference) in &self.event_type_preferences {
            if !(1..=10).contains(&preference.priority) {
                return Err(StreamError::validation(format!(
                    "Priority for event type '{}' must be between 1 and 10",
                    event_type
                )));
            }
        }

        let grouping = &self.intelligent_grouping;
        if !(0.0..=1.0).contains(&grouping.similarity_threshold) {
            return Err(StreamError::validation("Similarity threshold must be between 0 and 1"));
        }
        if grouping.enabled && grouping.time_window_ms == 0 {
            return Err(StreamError::validation("Grouping time window must be positive when grouping is enabled"));
        }

        Ok(())
    }

    /// Reason the event is rejected by the preference gate, if it is.
    pub fn gate(&self, event: &StreamEvent) -> Option<String> {
        if event.severity() < self.severity_minimum {
            return Some(format!(
                "Severity {} below user minimum {}",
                event.severity().as_str(),
                self.severity_minimum.as_str()
            ));
        }

        match self.event_type_preferences.get(&event.event_type()) {
            Some(preference) if !preference.enabled => {
                Some(format!("Event type {} disabled by user preferences", event.event_type()))
            }
            _ => None,
        }
    }

    pub fn type_priority(&self, event_type: EventType) -> u8 {
        self.event_type_preferences
            .get(&event_type)
            .map(|p| p.priority)
            .unwrap_or_else(default_type_priority)
    }
}
