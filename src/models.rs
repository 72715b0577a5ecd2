//! Event data model shared by every streaming component.
//!
//! A [`StreamEvent`] is immutable once produced: routing stamps a channel id
//! and filtering applies modifications by building new values through the
//! `with_*` methods, never by mutating an event other code may hold.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::error::{Result, StreamError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Threat,
    Behavior,
    Network,
    Intelligence,
    System,
}

impl EventType {
    pub const ALL: [EventType; 5] = [
        EventType::Threat,
        EventType::Behavior,
        EventType::Network,
        EventType::Intelligence,
        EventType::System,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Threat => "threat",
            EventType::Behavior => "behavior",
            EventType::Network => "network",
            EventType::Intelligence => "intelligence",
            EventType::System => "system",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "info" | "informational" => Some(Severity::Info),
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }

    pub fn rank(&self) -> u8 {
        *self as u8
    }
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Info
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery priority, used both for channels and for event metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Consumption profile reported by the transport at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientType {
    Cli,
    Web,
    Api,
    Mobile,
}

impl Default for ClientType {
    fn default() -> Self {
        ClientType::Web
    }
}

impl fmt::Display for ClientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientType::Cli => "cli",
            ClientType::Web => "web",
            ClientType::Api => "api",
            ClientType::Mobile => "mobile",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatData {
    pub threat_id: String,
    pub category: String,
    pub severity: Severity,
    pub confidence: f64,
    #[serde(default)]
    pub indicators: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorData {
    pub user: String,
    pub activity: String,
    pub anomaly_score: f64,
    pub severity: Severity,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkData {
    pub source_ip: String,
    pub destination_ip: String,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default)]
    pub bytes: u64,
    pub severity: Severity,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntelligenceData {
    pub indicator: String,
    pub indicator_type: String,
    pub feed: String,
    pub severity: Severity,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemData {
    pub component: String,
    pub message: String,
    pub severity: Severity,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

/// Structured payload; the event type is the variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    Threat(ThreatData),
    Behavior(BehaviorData),
    Network(NetworkData),
    Intelligence(IntelligenceData),
    System(SystemData),
}

const THREAT_FIELDS: &[&str] = &[
    "threat_id", "category", "severity", "confidence", "indicators", "source_ip", "target", "attributes",
];
const BEHAVIOR_FIELDS: &[&str] = &["user", "activity", "anomaly_score", "severity", "attributes"];
const NETWORK_FIELDS: &[&str] = &[
    "source_ip", "destination_ip", "protocol", "port", "bytes", "severity", "attributes",
];
const INTELLIGENCE_FIELDS: &[&str] = &["indicator", "indicator_type", "feed", "severity", "attributes"];
const SYSTEM_FIELDS: &[&str] = &["component", "message", "severity", "attributes"];

const METADATA_FIELDS: &[&str] = &[
    "source", "correlation_id", "user_id", "relevance_score", "channel_id", "priority", "processed_at", "tags",
];

const TOP_LEVEL_FIELDS: &[&str] = &["type", "timestamp", "severity", "data", "metadata"];

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::Threat(_) => EventType::Threat,
            EventPayload::Behavior(_) => EventType::Behavior,
            EventPayload::Network(_) => EventType::Network,
            EventPayload::Intelligence(_) => EventType::Intelligence,
            EventPayload::System(_) => EventType::System,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            EventPayload::Threat(d) => d.severity,
            EventPayload::Behavior(d) => d.severity,
            EventPayload::Network(d) => d.severity,
            EventPayload::Intelligence(d) => d.severity,
            EventPayload::System(d) => d.severity,
        }
    }

    pub fn attributes(&self) -> &Map<String, Value> {
        match self {
            EventPayload::Threat(d) => &d.attributes,
            EventPayload::Behavior(d) => &d.attributes,
            EventPayload::Network(d) => &d.attributes,
            EventPayload::Intelligence(d) => &d.attributes,
            EventPayload::System(d) => &d.attributes,
        }
    }

    fn attributes_mut(&mut self) -> &mut Map<String, Value> {
        match self {
            EventPayload::Threat(d) => &mut d.attributes,
            EventPayload::Behavior(d) => &mut d.attributes,
            EventPayload::Network(d) => &mut d.attributes,
            EventPayload::Intelligence(d) => &mut d.attributes,
            EventPayload::System(d) => &mut d.attributes,
        }
    }

    /// Field names a `data.<field>` path may reference for the given type.
    pub fn known_fields(event_type: EventType) -> &'static [&'static str] {
        match event_type {
            EventType::Threat => THREAT_FIELDS,
            EventType::Behavior => BEHAVIOR_FIELDS,
            EventType::Network => NETWORK_FIELDS,
            EventType::Intelligence => INTELLIGENCE_FIELDS,
            EventType::System => SYSTEM_FIELDS,
        }
    }

    fn is_known_field(name: &str) -> bool {
        EventType::ALL
            .iter()
            .any(|t| Self::known_fields(*t).contains(&name))
    }

    fn data_value(&self) -> Result<Value> {
        let value = match self {
            EventPayload::Threat(d) => serde_json::to_value(d)?,
            EventPayload::Behavior(d) => serde_json::to_value(d)?,
            EventPayload::Network(d) => serde_json::to_value(d)?,
            EventPayload::Intelligence(d) => serde_json::to_value(d)?,
            EventPayload::System(d) => serde_json::to_value(d)?,
        };
        Ok(value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub source: String,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relevance_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
    pub metadata: EventMetadata,
}

impl StreamEvent {
    pub fn new(payload: EventPayload, source: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            payload,
            metadata: EventMetadata {
                source: source.into(),
                correlation_id: Uuid::new_v4().to_string(),
                ..Default::default()
            },
        }
    }

    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    pub fn severity(&self) -> Severity {
        self.payload.severity()
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.metadata.user_id = Some(user_id.into());
        self
    }

    pub fn with_relevance(mut self, score: f64) -> Self {
        self.metadata.relevance_score = Some(score);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.metadata.priority = Some(priority);
        self
    }

    pub fn with_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.metadata.channel_id = Some(channel_id.into());
        self
    }

    pub fn with_processed_at(mut self, processed_at: DateTime<Utc>) -> Self {
        self.metadata.processed_at = Some(processed_at);
        self
    }

    /// Appends tags that are not already present, preserving order.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for tag in tags {
            let tag = tag.into();
            if !self.metadata.tags.contains(&tag) {
                self.metadata.tags.push(tag);
            }
        }
        self
    }

    pub fn with_attributes(mut self, attributes: &HashMap<String, Value>) -> Self {
        let target = self.payload.attributes_mut();
        for (key, value) in attributes {
            target.insert(key.clone(), value.clone());
        }
        self
    }

    /// Flat JSON view that condition field paths are resolved against:
    /// `{type, timestamp, severity, data, metadata}`.
    pub fn field_view(&self) -> Result<Value> {
        let mut view = Map::new();
        view.insert("type".to_string(), Value::String(self.event_type().as_str().to_string()));
        view.insert("timestamp".to_string(), Value::String(self.timestamp.to_rfc3339()));
        view.insert("severity".to_string(), Value::String(self.severity().as_str().to_string()));
        view.insert("data".to_string(), self.payload.data_value()?);
        view.insert("metadata".to_string(), serde_json::to_value(&self.metadata)?);
        Ok(Value::Object(view))
    }
}

/// Resolve a dotted field path against an event view. Missing fields read as null.
///
/// A first segment that is not a top-level field is looked up in `data`
/// first, then in `metadata`.
pub fn extract_field(view: &Value, field_path: &str) -> Value {
    let parts: Vec<&str> = field_path.split('.').collect();

    let mut current = if TOP_LEVEL_FIELDS.contains(&parts[0]) {
        view.get(parts[0])
    } else {
        view.get("data")
            .and_then(|d| d.get(parts[0]))
            .or_else(|| view.get("metadata").and_then(|m| m.get(parts[0])))
    };

    for part in parts.iter().skip(1) {
        current = match current {
            Some(Value::Array(items)) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
            Some(value) => value.get(part),
            None => None,
        };
    }

    current.cloned().unwrap_or(Value::Null)
}

/// Check a field path against the event schema so that typos are rejected
/// when a rule or channel filter is registered rather than silently never
/// matching.
pub fn validate_field_path(field_path: &str) -> Result<()> {
    if field_path.is_empty() {
        return Err(StreamError::validation("Field path cannot be empty"));
    }

    let parts: Vec<&str> = field_path.split('.').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(StreamError::validation(format!("Malformed field path '{}'", field_path)));
    }

    let valid = match parts[0] {
        "type" | "timestamp" | "severity" => parts.len() == 1,
        "data" => match parts.get(1) {
            None => true,
            Some(&"attributes") => true,
            Some(field) => EventPayload::is_known_field(field) && all_indices(&parts[2..]),
        },
        "metadata" => match parts.get(1) {
            None => true,
            Some(field) => METADATA_FIELDS.contains(field) && all_indices(&parts[2..]),
        },
        bare => {
            (bare == "attributes")
                || (parts.len() == 1 && (EventPayload::is_known_field(bare) || METADATA_FIELDS.contains(&bare)))
        }
    };

    if valid {
        Ok(())
    } else {
        Err(StreamError::validation(format!("Unknown field path '{}'", field_path)))
    }
}

fn all_indices(parts: &[&str]) -> bool {
    parts.iter().all(|p| p.parse::<usize>().is_ok())
}
