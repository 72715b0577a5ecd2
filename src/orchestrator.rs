//! Streaming Orchestrator - client lifecycle, control commands and the
//! delivery loop tying channels, filtering and throttling together.
//!
//! Delivery path for one produced event:
//! route to channels -> (aggregations skip filtering) -> client filter ->
//! smart filtering -> feed processing time back into throttling ->
//! admission check -> transport.
//!
//! Smart filtering is fail-open: if the engine errors, the original event is
//! delivered unfiltered. This keeps the security stream available when a
//! rule set is broken or too slow, at the cost of an occasional unfiltered
//! event. Changing that trade-off means changing `filter_event`.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channels::{Channel, ChannelConfig, ChannelManager, Deliverable, EventAggregation};
use crate::conditions::{AnalyticEvaluator, UnimplementedAnalytics};
use crate::config::StreamingConfig;
use crate::error::{Result, StreamError};
use crate::filtering::{FilterContext, FilterDecision, SmartFilteringEngine};
use crate::metrics::StreamMetrics;
use crate::models::{ClientType, Priority, StreamEvent};
use crate::protocol::{CommandResult, ControlCommand, FilterSummary, OutboundMessage};
use crate::session::ClientSession;
use crate::throttling::{AdaptiveThrottlingEngine, MetricsUpdate, ThrottleRecommendation};
use crate::transport::Transport;

/// Outcome counters for one `process_event` or sweep call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub routed: usize,
    pub delivered: usize,
    pub aggregations: usize,
    pub blocked: usize,
    pub client_filtered: usize,
    pub throttled: usize,
    pub fail_open: usize,
    pub transport_errors: usize,
}

impl DeliveryReport {
    fn merge(&mut self, other: DeliveryReport) {
        self.routed += other.routed;
        self.delivered += other.delivered;
        self.aggregations += other.aggregations;
        self.blocked += other.blocked;
        self.client_filtered += other.client_filtered;
        self.throttled += other.throttled;
        self.fail_open += other.fail_open;
        self.transport_errors += other.transport_errors;
    }
}

/// Result of running one event through the client filter and smart filtering.
enum FilterOutcome {
    Deliver(StreamEvent, Option<FilterSummary>),
    ClientFiltered,
    Blocked,
    FailOpen(StreamEvent),
}

pub struct StreamingOrchestrator {
    config: StreamingConfig,
    channels: Arc<ChannelManager>,
    throttling: Arc<AdaptiveThrottlingEngine>,
    filtering: Arc<SmartFilteringEngine>,
    transport: Arc<dyn Transport>,
    sessions: DashMap<String, ClientSession>,
    metrics: Arc<StreamMetrics>,
}

impl StreamingOrchestrator {
    pub fn new(config: StreamingConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        Self::with_analytics(config, transport, Arc::new(UnimplementedAnalytics))
    }

    pub fn with_analytics(
        config: StreamingConfig,
        transport: Arc<dyn Transport>,
        analytics: Arc<dyn AnalyticEvaluator>,
    ) -> Result<Self> {
        config.validate()?;
        info!("Initializing streaming orchestrator");

        let channels = Arc::new(ChannelManager::new(
            config.channels.clone(),
            config.filtering.regex_size_limit,
        ));
        let throttling = Arc::new(AdaptiveThrottlingEngine::new(config.throttling.clone()));
        let filtering = Arc::new(SmartFilteringEngine::with_analytics(config.filtering.clone(), analytics)?);
        let metrics = Arc::new(StreamMetrics::new()?);

        Ok(Self {
            config,
            channels,
            throttling,
            filtering,
            transport,
            sessions: DashMap::new(),
            metrics,
        })
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    pub fn channels(&self) -> &Arc<ChannelManager> {
        &self.channels
    }

    pub fn throttling(&self) -> &Arc<AdaptiveThrottlingEngine> {
        &self.throttling
    }

    pub fn filtering(&self) -> &Arc<SmartFilteringEngine> {
        &self.filtering
    }

    pub fn metrics(&self) -> &Arc<StreamMetrics> {
        &self.metrics
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.sessions.contains_key(client_id)
    }

    pub fn connected_clients(&self) -> usize {
        self.sessions.len()
    }

    /// Register an authenticated client: default channel, permissive
    /// client filter, throttling state, then a welcome message.
    pub async fn connect_client(
        &self,
        client_id: &str,
        user_id: Option<String>,
        client_type: ClientType,
    ) -> Result<Channel> {
        if client_id.is_empty() {
            return Err(StreamError::validation("Client ID cannot be empty"));
        }
        if self.sessions.contains_key(client_id) {
            return Err(StreamError::conflict(format!("Client {} is already connected", client_id)));
        }

        let channel = self.channels.create_channel(
            client_id,
            ChannelConfig::new(self.config.orchestrator.default_channel_type.clone()),
        )?;
        self.throttling.register_client(client_id, client_type);
        let recommendation = self.throttling.get_recommendation(client_id);

        self.sessions.insert(
            client_id.to_string(),
            ClientSession::new(
                client_id,
                user_id.clone(),
                client_type,
                channel.id.clone(),
                recommendation.recommended_rate,
            ),
        );
        self.metrics.set_connected_clients(self.sessions.len());

        info!(
            "Client {} connected (user={}, type={}, default channel {})",
            client_id,
            user_id.as_deref().unwrap_or("-"),
            client_type,
            channel.id
        );

        let welcome = OutboundMessage::Welcome {
            client_id: client_id.to_string(),
            default_channel_id: channel.id.clone(),
            server_time: Utc::now(),
            throttle: recommendation,
        };
        self.send(client_id, welcome).await;

        Ok(channel)
    }

    /// Drop every piece of per-client state. Preferences stored under a user
    /// id outlive the connection; ones keyed by the client id do not.
    pub fn disconnect_client(&self, client_id: &str) -> bool {
        let Some((_, session)) = self.sessions.remove(client_id) else {
            return false;
        };

        let closed = self.channels.close_client_channels(client_id);
        self.throttling.remove_client(client_id);
        if session.user_id.is_none() {
            self.filtering.remove_user_preferences(client_id);
        }
        self.metrics.set_connected_clients(self.sessions.len());

        info!("Client {} disconnected, closed {} channels", client_id, closed.len());
        true
    }

    /// Execute a control command and send its result to the client. The
    /// result is also returned to the caller.
    pub async fn handle_command(&self, client_id: &str, command: ControlCommand) -> CommandResult {
        self.metrics.record_command();
        let name = command.name();
        debug!("Client {} sent command {}", client_id, name);

        let (result, throttle_update) = match self.execute_command(client_id, command) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Command {} from client {} failed: {}", name, client_id, e);
                (CommandResult::failed(name, &e), None)
            }
        };

        if self.sessions.contains_key(client_id) {
            self.send(client_id, OutboundMessage::CommandResult(result.clone())).await;
            if let Some(recommendation) = throttle_update {
                self.send(client_id, OutboundMessage::ThrottleUpdate { recommendation }).await;
            }
        }
        result
    }

    fn execute_command(
        &self,
        client_id: &str,
        command: ControlCommand,
    ) -> Result<(CommandResult, Option<ThrottleRecommendation>)> {
        if !self.sessions.contains_key(client_id) {
            return Err(StreamError::not_found(format!("Client {} is not connected", client_id)));
        }
        let name = command.name();

        let result = match command {
            ControlCommand::ConfigureStreams { config } => {
                let existing = if config.replace_existing {
                    0
                } else {
                    self.channels.client_channel_count(client_id)
                };
                let limit = self.config.channels.max_channels_per_client;
                if existing + config.channels.len() > limit {
                    return Err(StreamError::validation(format!(
                        "Stream configuration needs {} channels, limit is {}",
                        existing + config.channels.len(),
                        limit
                    )));
                }
                for channel in &config.channels {
                    self.channels.validate_config(channel)?;
                }

                if config.replace_existing {
                    self.channels.close_client_channels(client_id);
                }
                let mut created = Vec::with_capacity(config.channels.len());
                for channel in config.channels {
                    created.push(self.channels.create_channel(client_id, channel)?.id);
                }

                let mut session = self.session_mut(client_id)?;
                if let Some(update) = config.filter {
                    session.filter.merge(update);
                }
                if config.replace_existing {
                    session.default_channel_id = created.first().cloned().unwrap_or_default();
                }
                CommandResult::ok(name, json!({ "channels": created, "filter": session.filter }))
            }
            ControlCommand::UpdateFilters { filter } => {
                let mut session = self.session_mut(client_id)?;
                session.filter.merge(filter);
                CommandResult::ok(name, json!({ "filter": session.filter }))
            }
            ControlCommand::UpdateChannelFilters { channel_id, filters } => {
                self.ensure_owner(client_id, &channel_id)?;
                if self.channels.update_channel_filters(&channel_id, filters)? {
                    CommandResult::ok(name, json!({ "channel_id": channel_id, "updated": true }))
                } else {
                    CommandResult::unsuccessful(name, json!({ "channel_id": channel_id, "updated": false }))
                }
            }
            ControlCommand::CreateChannel { config } => {
                let channel = self.channels.create_channel(client_id, config)?;
                CommandResult::ok(name, serde_json::to_value(&channel)?)
            }
            ControlCommand::CloseChannel { channel_id } => match self.channels.channel_owner(&channel_id) {
                Some(owner) if owner != client_id => {
                    return Err(StreamError::permission(format!(
                        "Channel {} belongs to another client",
                        channel_id
                    )));
                }
                Some(_) => {
                    let closed = self.channels.close_channel(&channel_id);
                    CommandResult::ok(name, json!({ "channel_id": channel_id, "closed": closed }))
                }
                None => CommandResult::unsuccessful(name, json!({ "channel_id": channel_id, "closed": false })),
            },
            ControlCommand::RequestThrottleAdjustment { metrics } => {
                {
                    let session = self.session(client_id)?;
                    match metrics {
                        Some(update) => {
                            let update = MetricsUpdate {
                                client_type: Some(session.client_type),
                                ..update
                            };
                            self.throttling.update_metrics(client_id, update);
                        }
                        // Re-track a client the inactivity sweep dropped.
                        None => self.throttling.register_client(client_id, session.client_type),
                    }
                }
                let recommendation = self.throttling.get_recommendation(client_id);
                self.apply_recommendation(client_id, &recommendation);
                let data = serde_json::to_value(&recommendation)?;
                return Ok((CommandResult::ok(name, data), Some(recommendation)));
            }
            ControlCommand::UpdateSmartFilters { preferences } => {
                let key = self.session(client_id)?.preference_key().to_string();
                self.filtering.set_user_preferences(&key, preferences)?;
                CommandResult::ok(name, json!({ "preferences_key": key }))
            }
            ControlCommand::GetStreamMetrics => CommandResult::ok(
                name,
                json!({
                    "client": self.channels.get_client_metrics(client_id),
                    "system": self.channels.get_system_metrics(),
                    "throttle": self.throttling.get_recommendation(client_id),
                    "delivery": self.metrics.snapshot(),
                }),
            ),
            ControlCommand::GetFilteringStats => {
                CommandResult::ok(name, serde_json::to_value(self.filtering.get_statistics())?)
            }
        };

        Ok((result, None))
    }

    fn session(&self, client_id: &str) -> Result<dashmap::mapref::one::Ref<'_, String, ClientSession>> {
        self.sessions
            .get(client_id)
            .ok_or_else(|| StreamError::not_found(format!("Client {} is not connected", client_id)))
    }

    fn session_mut(&self, client_id: &str) -> Result<dashmap::mapref::one::RefMut<'_, String, ClientSession>> {
        self.sessions
            .get_mut(client_id)
            .ok_or_else(|| StreamError::not_found(format!("Client {} is not connected", client_id)))
    }

    fn ensure_owner(&self, client_id: &str, channel_id: &str) -> Result<()> {
        match self.channels.channel_owner(channel_id) {
            Some(owner) if owner == client_id => Ok(()),
            Some(_) => Err(StreamError::permission(format!(
                "Channel {} belongs to another client",
                channel_id
            ))),
            None => Err(StreamError::not_found(format!("Channel {} not found", channel_id))),
        }
    }

    pub fn get_throttle_recommendation(&self, client_id: &str) -> ThrottleRecommendation {
        self.throttling.get_recommendation(client_id)
    }

    /// Resize the client's limiter. Returns whether the rate changed.
    fn apply_recommendation(&self, client_id: &str, recommendation: &ThrottleRecommendation) -> bool {
        match self.sessions.get_mut(client_id) {
            Some(mut session) => {
                let changed = session.apply_rate(recommendation.recommended_rate);
                if changed {
                    debug!(
                        "Client {} admission rate now {}/s ({})",
                        client_id, recommendation.recommended_rate, recommendation.throttle_level
                    );
                }
                changed
            }
            None => false,
        }
    }

    /// Route one produced event and deliver whatever it yields.
    pub async fn process_event(&self, event: StreamEvent) -> DeliveryReport {
        self.metrics.record_event_received();
        let routed = self.channels.process_event(&event);

        let mut report = DeliveryReport {
            routed: routed.len(),
            ..Default::default()
        };
        for (channel_id, deliverable) in routed {
            report.merge(self.deliver_routed(&channel_id, deliverable).await);
        }
        report
    }

    pub async fn flush_aggregations(&self) -> DeliveryReport {
        self.flush_aggregations_at(Utc::now()).await
    }

    /// Deliver every aggregation window that has elapsed by `now`.
    pub async fn flush_aggregations_at(&self, now: DateTime<Utc>) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for aggregation in self.channels.flush_expired(now) {
            report.routed += 1;
            let channel_id = aggregation.channel_id.clone();
            report.merge(self.deliver_routed(&channel_id, Deliverable::Aggregation(aggregation)).await);
        }
        report
    }

    async fn deliver_routed(&self, channel_id: &str, deliverable: Deliverable) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let Some(channel) = self.channels.get_channel(channel_id) else {
            debug!("Channel {} closed before delivery", channel_id);
            return report;
        };
        let client_id = channel.client_id.as_str();

        match deliverable {
            Deliverable::Aggregation(aggregation) => {
                self.deliver_aggregation(client_id, &channel, aggregation, &mut report).await;
            }
            Deliverable::Event(event) => {
                let (event, summary) = match self.filter_event(client_id, event) {
                    FilterOutcome::Deliver(event, summary) => (event, summary),
                    FilterOutcome::FailOpen(event) => {
                        report.fail_open += 1;
                        (event, None)
                    }
                    FilterOutcome::Blocked => {
                        report.blocked += 1;
                        return report;
                    }
                    FilterOutcome::ClientFiltered => {
                        report.client_filtered += 1;
                        return report;
                    }
                };

                if !self.admit(client_id, channel.priority) {
                    self.metrics.record_throttled();
                    report.throttled += 1;
                    return report;
                }

                let message = OutboundMessage::Event {
                    channel_id: channel.id.clone(),
                    event,
                    filter: summary,
                };
                if self.send(client_id, message).await {
                    self.metrics.record_event_delivered();
                    report.delivered += 1;
                } else {
                    report.transport_errors += 1;
                }
            }
        }
        report
    }

    /// Aggregations were already batched; they bypass both filters.
    async fn deliver_aggregation(
        &self,
        client_id: &str,
        channel: &Channel,
        aggregation: EventAggregation,
        report: &mut DeliveryReport,
    ) {
        if !self.admit(client_id, channel.priority) {
            self.metrics.record_throttled();
            report.throttled += 1;
            return;
        }

        let message = OutboundMessage::Aggregation {
            channel_id: channel.id.clone(),
            aggregation,
        };
        if self.send(client_id, message).await {
            self.metrics.record_aggregation_delivered();
            report.aggregations += 1;
        } else {
            report.transport_errors += 1;
        }
    }

    fn filter_event(&self, client_id: &str, event: StreamEvent) -> FilterOutcome {
        let context = {
            let Some(session) = self.sessions.get(client_id) else {
                return FilterOutcome::ClientFiltered;
            };
            if !session.filter.matches(&event) {
                self.metrics.record_client_filtered();
                return FilterOutcome::ClientFiltered;
            }
            FilterContext {
                client_id: client_id.to_string(),
                user_id: Some(session.preference_key().to_string()),
                client_type: session.client_type,
                user_preferences: None,
                session_context: None,
            }
        };

        let started = std::time::Instant::now();
        match self.filtering.apply_filters(&event, &context) {
            Ok(result) => {
                let processing_time_ms = result.metadata.processing_time_ms;
                self.metrics.record_filter_latency(processing_time_ms);

                if result.action == FilterDecision::Block {
                    self.metrics.record_blocked();
                    debug!("Event {} blocked for client {}", event.metadata.correlation_id, client_id);
                    return FilterOutcome::Blocked;
                }

                self.record_processing_time(client_id, processing_time_ms);
                let summary = FilterSummary {
                    action: result.action,
                    score: result.score,
                    matched_rules: result.matched_rules,
                };
                let delivered = match result.modified_event {
                    Some(modified) if result.action == FilterDecision::Modify => modified,
                    _ => event,
                };
                FilterOutcome::Deliver(delivered, Some(summary))
            }
            Err(e) => {
                let processing_time_ms = started.elapsed().as_secs_f64() * 1000.0;
                warn!(
                    "Filtering failed for event {} (client {}), delivering unfiltered: {}",
                    event.metadata.correlation_id, client_id, e
                );
                self.metrics.record_fail_open();
                self.record_processing_time(client_id, processing_time_ms);
                FilterOutcome::FailOpen(event)
            }
        }
    }

    /// Feed one filtering sample into the client's throttling metrics.
    ///
    /// The session guard is held across the update so a concurrent disconnect
    /// removes the throttling state only after this sample has landed.
    fn record_processing_time(&self, client_id: &str, processing_time_ms: f64) {
        let recommendation = {
            let Some(session) = self.sessions.get(client_id) else {
                return;
            };
            let update = MetricsUpdate {
                connection_latency: Some(processing_time_ms),
                message_processing_rate: (processing_time_ms > 0.0).then(|| 1000.0 / processing_time_ms),
                error_rate: Some(session.delivery_error_rate()),
                queue_depth: self.transport.queue_depth(client_id),
                client_type: Some(session.client_type),
                ..Default::default()
            };
            self.throttling.update_metrics(client_id, update)
        };

        if let Some(recommendation) = recommendation {
            self.apply_recommendation(client_id, &recommendation);
        }
    }

    fn admit(&self, client_id: &str, priority: Priority) -> bool {
        if !self.config.orchestrator.enforce_rate_limit || priority == Priority::Critical {
            return true;
        }
        self.sessions
            .get(client_id)
            .map(|session| session.try_admit())
            .unwrap_or(false)
    }

    /// Hand a message to the transport. Failures are counted against the
    /// client and never propagate.
    async fn send(&self, client_id: &str, message: OutboundMessage) -> bool {
        let outcome = self.transport.deliver(client_id, message).await;
        let success = outcome.is_ok();
        if let Err(e) = outcome {
            self.metrics.record_transport_error();
            debug!("Delivery to {} failed: {}", client_id, e);
        }
        if let Some(mut session) = self.sessions.get_mut(client_id) {
            session.record_delivery(success);
        }
        success
    }

    pub fn system_metrics(&self) -> Value {
        json!({
            "timestamp": Utc::now(),
            "connected_clients": self.sessions.len(),
            "channels": self.channels.get_system_metrics(),
            "throttling": self.throttling.get_stats(),
            "delivery": self.metrics.snapshot(),
        })
    }

    pub async fn broadcast_system_metrics(&self) -> Result<usize> {
        let message = OutboundMessage::SystemMetrics {
            metrics: self.system_metrics(),
        };
        self.transport.broadcast(message).await
    }

    /// Spawn the periodic tasks: aggregation sweep, throttling maintenance,
    /// system-metrics broadcast and rule-statistics logging.
    pub fn start_background_tasks(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        info!("Starting orchestrator background tasks");
        let mut handles = Vec::new();

        let orchestrator = Arc::clone(self);
        let token = cancel.clone();
        handles.push(tokio::spawn(async move {
            let period = std::time::Duration::from_millis(orchestrator.config.channels.sweep_interval_ms.max(1));
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = orchestrator.flush_aggregations().await;
                        if report.routed > 0 {
                            debug!("Aggregation sweep delivered {} windows", report.aggregations);
                        }
                    }
                }
            }
        }));

        handles.push(AdaptiveThrottlingEngine::spawn_maintenance(
            Arc::clone(&self.throttling),
            cancel.clone(),
        ));

        let orchestrator = Arc::clone(self);
        let token = cancel.clone();
        handles.push(tokio::spawn(async move {
            let period = std::time::Duration::from_millis(
                orchestrator.config.orchestrator.metrics_broadcast_interval_ms.max(1),
            );
            let mut ticker = interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        match orchestrator.broadcast_system_metrics().await {
                            Ok(count) => debug!("Broadcast system metrics to {} clients", count),
                            Err(e) => warn!("System metrics broadcast failed: {}", e),
                        }
                    }
                }
            }
        }));

        handles.push(SmartFilteringEngine::spawn_stats_logger(
            Arc::clone(&self.filtering),
            cancel,
        ));

        handles
    }
}
