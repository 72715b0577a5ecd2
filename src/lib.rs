//! SIEM Event Streaming Library
//!
//! Per-client delivery of security events: channel routing and time-window
//! aggregation, rule-based smart filtering, and adaptive throttling driven by
//! observed client capacity.
//!
//! # Modules
//!
//! - `models`: Event data model and field-path extraction
//! - `conditions`: Filter conditions and their evaluator
//! - `throttling`: Adaptive throttling engine
//! - `filtering`: Smart filtering engine, rules and user preferences
//! - `channels`: Channel manager and aggregation windows
//! - `orchestrator`: Client lifecycle, control commands and the delivery loop
//! - `transport`: Boundary to the client-facing connection layer

pub mod channels;
pub mod conditions;
pub mod config;
pub mod error;
pub mod filtering;
pub mod generator;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod protocol;
pub mod session;
pub mod throttling;
pub mod transport;

pub use channels::{Channel, ChannelConfig, ChannelManager, Deliverable, EventAggregation};
pub use conditions::{AdvancedFilter, AnalyticEvaluator, ConditionOperator, FilterCondition};
pub use config::StreamingConfig;
pub use error::{Result, StreamError};
pub use filtering::{
    FilterAction, FilterContext, FilterDecision, FilterResult, SmartFilterRule, SmartFilteringEngine,
    UserFilterPreferences,
};
pub use models::{ClientType, EventPayload, EventType, Priority, Severity, StreamEvent};
pub use orchestrator::{DeliveryReport, StreamingOrchestrator};
pub use protocol::{CommandResult, ControlCommand, OutboundMessage};
pub use throttling::{AdaptiveThrottlingEngine, MetricsUpdate, ThrottleLevel, ThrottleRecommendation};
pub use transport::{ChannelTransport, Transport};
