//! Smart Filtering Engine - user-preference gate, weighted rule evaluation and
//! heuristic relevance scoring for individual events.
//!
//! Rules are configuration data. The hot path reads a snapshot of the rule
//! list and only writes rule statistics, which live in their own map keyed by
//! rule id so that admin operations never contend with counters.

pub mod preferences;
pub mod rules;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::conditions::{AnalyticEvaluator, ConditionEvaluator, UnimplementedAnalytics};
use crate::config::FilteringConfig;
use crate::error::{Result, StreamError};
use crate::models::{ClientType, StreamEvent};

pub use preferences::{EventTypePreference, IntelligentGrouping, NoiseLevel, NoiseReduction, UserFilterPreferences};
pub use rules::{default_rules, FilterAction, RuleStatistics, SmartFilterRule};

const ALERT_CHANNEL_CAPACITY: usize = 256;

/// Fraction of a rule's condition weight that must match, exclusive.
pub const MATCH_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterDecision {
    Allow,
    Block,
    Modify,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterContext {
    pub client_id: String,
    pub user_id: Option<String>,
    pub client_type: ClientType,
    /// Takes precedence over preferences stored for `user_id`.
    pub user_preferences: Option<UserFilterPreferences>,
    pub session_context: Option<Value>,
}

impl FilterContext {
    pub fn new(client_id: impl Into<String>, client_type: ClientType) -> Self {
        Self {
            client_id: client_id.into(),
            client_type,
            ..Default::default()
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_preferences(mut self, preferences: UserFilterPreferences) -> Self {
        self.user_preferences = Some(preferences);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterResultMetadata {
    pub processing_time_ms: f64,
    pub rules_evaluated: usize,
    pub conditions_matched: usize,
    /// Set by an `aggregate` action or by intelligent grouping preferences.
    pub aggregate_hint: bool,
    pub alerts_raised: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterResult {
    pub action: FilterDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_event: Option<StreamEvent>,
    pub matched_rules: Vec<String>,
    pub score: f64,
    pub reasoning: Vec<String>,
    pub metadata: FilterResultMetadata,
}

impl FilterResult {
    fn new(action: FilterDecision) -> Self {
        Self {
            action,
            modified_event: None,
            matched_rules: Vec::new(),
            score: 0.0,
            reasoning: Vec::new(),
            metadata: FilterResultMetadata::default(),
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.action == FilterDecision::Block
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterAlert {
    pub rule_id: String,
    pub rule_name: String,
    pub message: String,
    pub client_id: String,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilteringStatistics {
    pub total_rules: usize,
    pub enabled_rules: usize,
    pub events_processed: u64,
    pub events_blocked: u64,
    pub events_modified: u64,
    pub alerts_raised: u64,
    pub user_preferences: usize,
    pub cached_regexes: usize,
    pub rules: HashMap<String, RuleStatistics>,
}

/// Outcome of testing one rule's conditions.
struct RuleMatch {
    matched_weight: f64,
    total_weight: f64,
    conditions_matched: usize,
}

impl RuleMatch {
    fn ratio(&self) -> f64 {
        if self.total_weight == 0.0 {
            1.0
        } else {
            self.matched_weight / self.total_weight
        }
    }

    /// A rule without conditions matches every event.
    fn is_match(&self) -> bool {
        self.total_weight == 0.0 || self.ratio() > MATCH_THRESHOLD
    }
}

pub struct SmartFilteringEngine {
    config: FilteringConfig,
    /// Sorted by descending priority; equal priorities keep insertion order.
    rules: RwLock<Vec<Arc<SmartFilterRule>>>,
    rule_stats: DashMap<String, RuleStatistics>,
    user_preferences: DashMap<String, UserFilterPreferences>,
    evaluator: ConditionEvaluator,
    alerts: broadcast::Sender<FilterAlert>,
    events_processed: AtomicU64,
    events_blocked: AtomicU64,
    events_modified: AtomicU64,
    alerts_raised: AtomicU64,
}

impl SmartFilteringEngine {
    pub fn new(config: FilteringConfig) -> Result<Self> {
        Self::with_analytics(config, Arc::new(UnimplementedAnalytics))
    }

    pub fn with_analytics(config: FilteringConfig, analytics: Arc<dyn AnalyticEvaluator>) -> Result<Self> {
        let (alerts, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        let engine = Self {
            evaluator: ConditionEvaluator::with_analytics(config.regex_size_limit, analytics),
            config,
            rules: RwLock::new(Vec::new()),
            rule_stats: DashMap::new(),
            user_preferences: DashMap::new(),
            alerts,
            events_processed: AtomicU64::new(0),
            events_blocked: AtomicU64::new(0),
            events_modified: AtomicU64::new(0),
            alerts_raised: AtomicU64::new(0),
        };

        if engine.config.install_default_rules {
            for rule in default_rules() {
                engine.add_rule(rule)?;
            }
            info!("Loaded {} default filter rules", engine.rules.read().len());
        }

        Ok(engine)
    }

    pub fn config(&self) -> &FilteringConfig {
        &self.config
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<FilterAlert> {
        self.alerts.subscribe()
    }

    /// Run the preference gate, rules and heuristics against one event.
    ///
    /// Individual condition failures are non-matches. An `Err` means the
    /// pipeline as a whole failed (view construction or budget exhaustion)
    /// and the caller decides how to deliver.
    pub fn apply_filters(&self, event: &StreamEvent, context: &FilterContext) -> Result<FilterResult> {
        let started = Instant::now();
        self.events_processed.fetch_add(1, Ordering::Relaxed);

        if !self.config.enabled {
            let mut result = FilterResult::new(FilterDecision::Allow);
            result.reasoning.push("Filtering disabled".to_string());
            result.metadata.processing_time_ms = elapsed_ms(started);
            return Ok(result);
        }

        let preferences = self.resolve_preferences(context);

        if let Some(prefs) = &preferences {
            if let Some(reason) = prefs.gate(event) {
                debug!("Event {} blocked by preferences: {}", event.metadata.correlation_id, reason);
                self.events_blocked.fetch_add(1, Ordering::Relaxed);
                let mut result = FilterResult::new(FilterDecision::Block);
                result.reasoning.push(reason);
                result.metadata.processing_time_ms = elapsed_ms(started);
                return Ok(result);
            }
        }

        let mut result = FilterResult::new(FilterDecision::Allow);
        let mut working: Option<StreamEvent> = None;
        let mut view = event.field_view()?;

        let rules = self.rules.read().clone();

        'rules: for rule in rules.iter().filter(|r| r.enabled) {
            let current = working.as_ref().unwrap_or(event);
            let outcome = self.evaluate_rule(rule, &view, current);
            result.metadata.rules_evaluated += 1;
            result.metadata.conditions_matched += outcome.conditions_matched;

            let matched = outcome.is_match();
            self.record_rule(&rule.id, matched, rule_blocks(rule) && matched);

            if matched {
                result.matched_rules.push(rule.id.clone());
                result.score += outcome.ratio();
                result.reasoning.push(format!(
                    "Rule '{}' matched ({:.0}% of condition weight)",
                    rule.name,
                    outcome.ratio() * 100.0
                ));

                let mut changed = false;
                for action in &rule.actions {
                    match action {
                        FilterAction::Block => {
                            result.action = FilterDecision::Block;
                            result.reasoning.push(format!("Blocked by rule '{}'", rule.name));
                            break 'rules;
                        }
                        FilterAction::Allow => {}
                        FilterAction::Modify {
                            priority,
                            relevance_score,
                            attributes,
                        } => {
                            let mut next = working.take().unwrap_or_else(|| event.clone());
                            if let Some(priority) = priority {
                                next = next.with_priority(*priority);
                            }
                            if let Some(score) = relevance_score {
                                next = next.with_relevance(*score);
                            }
                            if !attributes.is_empty() {
                                next = next.with_attributes(attributes);
                            }
                            working = Some(next);
                            changed = true;
                        }
                        FilterAction::Tag { tags } => {
                            let next = working.take().unwrap_or_else(|| event.clone());
                            working = Some(next.with_tags(tags.iter().cloned()));
                            changed = true;
                        }
                        FilterAction::Route { channel_id } => {
                            let next = working.take().unwrap_or_else(|| event.clone());
                            working = Some(next.with_channel(channel_id.clone()));
                            changed = true;
                        }
                        FilterAction::Aggregate => {
                            result.metadata.aggregate_hint = true;
                        }
                        FilterAction::Alert { message } => {
                            self.raise_alert(rule, message, event, context);
                            result.metadata.alerts_raised += 1;
                        }
                    }
                }

                if changed {
                    result.action = FilterDecision::Modify;
                    if let Some(modified) = &working {
                        view = modified.field_view()?;
                    }
                }
            }

            self.check_budget(started)?;
        }

        match result.action {
            FilterDecision::Block => {
                self.events_blocked.fetch_add(1, Ordering::Relaxed);
            }
            FilterDecision::Modify => {
                self.events_modified.fetch_add(1, Ordering::Relaxed);
                result.modified_event = working.map(|e| e.with_processed_at(Utc::now()));
            }
            FilterDecision::Allow => {
                let (score, notes) = self.heuristic_score(event, preferences.as_ref());
                result.score += score;
                result.reasoning.extend(notes);
            }
        }

        if let Some(prefs) = &preferences {
            if prefs.intelligent_grouping.enabled {
                result.metadata.aggregate_hint = true;
            }
        }

        result.metadata.processing_time_ms = elapsed_ms(started);
        Ok(result)
    }

    fn resolve_preferences(&self, context: &FilterContext) -> Option<UserFilterPreferences> {
        if let Some(prefs) = &context.user_preferences {
            return Some(prefs.clone());
        }
        context
            .user_id
            .as_ref()
            .and_then(|user_id| self.user_preferences.get(user_id).map(|p| p.clone()))
    }

    fn evaluate_rule(&self, rule: &SmartFilterRule, view: &Value, event: &StreamEvent) -> RuleMatch {
        let mut outcome = RuleMatch {
            matched_weight: 0.0,
            total_weight: 0.0,
            conditions_matched: 0,
        };

        for condition in &rule.conditions {
            let weight = condition.effective_weight();
            outcome.total_weight += weight;

            match self.evaluator.evaluate(condition, view, event) {
                Ok(true) => {
                    outcome.matched_weight += weight;
                    outcome.conditions_matched += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("Rule '{}' condition on '{}' failed: {}", rule.id, condition.field, e);
                }
            }
        }

        outcome
    }

    fn check_budget(&self, started: Instant) -> Result<()> {
        let limit_ms = self.config.max_evaluation_time_ms;
        if limit_ms == 0 {
            return Ok(());
        }
        let elapsed = elapsed_ms(started);
        if elapsed > limit_ms as f64 {
            return Err(StreamError::EvaluationBudgetExceeded {
                elapsed_ms: elapsed,
                limit_ms,
            });
        }
        Ok(())
    }

    fn record_rule(&self, rule_id: &str, matched: bool, filtered: bool) {
        if let Some(mut stats) = self.rule_stats.get_mut(rule_id) {
            stats.events_processed += 1;
            if matched {
                stats.events_matched += 1;
                stats.last_triggered = Some(Utc::now());
            }
            if filtered {
                stats.events_filtered += 1;
            }
        }
    }

    fn raise_alert(&self, rule: &SmartFilterRule, message: &str, event: &StreamEvent, context: &FilterContext) {
        self.alerts_raised.fetch_add(1, Ordering::Relaxed);
        warn!(
            "Filter alert from rule '{}': {} (event {}, client {})",
            rule.name, message, event.metadata.correlation_id, context.client_id
        );
        let alert = FilterAlert {
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            message: message.to_string(),
            client_id: context.client_id.clone(),
            correlation_id: event.metadata.correlation_id.clone(),
            timestamp: Utc::now(),
        };
        // No subscribers is fine.
        let _ = self.alerts.send(alert);
    }

    fn heuristic_score(&self, event: &StreamEvent, preferences: Option<&UserFilterPreferences>) -> (f64, Vec<String>) {
        let heuristics = &self.config.heuristics;
        let mut score = 0.0;
        let mut notes = Vec::new();
        if !heuristics.enabled {
            return (score, notes);
        }

        if let Some(relevance) = event.metadata.relevance_score {
            let contribution = (relevance - 0.5) * heuristics.relevance_weight;
            score += contribution;
            notes.push(format!("Relevance {:.2} contributes {:+.3}", relevance, contribution));
        }

        if let Some(prefs) = preferences {
            if prefs.noise_reduction.enabled && event.severity() <= crate::models::Severity::Low {
                let penalty = heuristics.noise_penalty * prefs.noise_reduction.level.factor();
                score -= penalty;
                notes.push(format!("Noise reduction penalty -{:.3}", penalty));
            }

            let type_priority = prefs.type_priority(event.event_type());
            if type_priority != 5 {
                let bonus = (type_priority as f64 - 5.0) * heuristics.type_priority_weight;
                score += bonus;
                notes.push(format!("Event type priority {} contributes {:+.3}", type_priority, bonus));
            }
        }

        (score, notes)
    }

    fn validate_rule(&self, rule: &SmartFilterRule) -> Result<()> {
        if rule.id.is_empty() {
            return Err(StreamError::validation("Rule ID cannot be empty"));
        }
        if rule.name.is_empty() {
            return Err(StreamError::validation("Rule name cannot be empty"));
        }
        if rule.actions.is_empty() {
            return Err(StreamError::validation(format!("Rule '{}' must have at least one action", rule.id)));
        }

        for condition in &rule.conditions {
            self.evaluator.validate(condition)?;
        }

        for action in &rule.actions {
            match action {
                FilterAction::Route { channel_id } if channel_id.is_empty() => {
                    return Err(StreamError::validation("Route action requires a channel id"));
                }
                FilterAction::Tag { tags } if tags.is_empty() => {
                    return Err(StreamError::validation("Tag action requires at least one tag"));
                }
                FilterAction::Modify {
                    relevance_score: Some(score),
                    ..
                } if !(0.0..=1.0).contains(score) => {
                    return Err(StreamError::validation("Relevance score must be between 0 and 1"));
                }
                _ => {}
            }
        }

        Ok(())
    }

    pub fn add_rule(&self, rule: SmartFilterRule) -> Result<()> {
        self.validate_rule(&rule)?;

        let mut rules = self.rules.write();
        if rules.iter().any(|r| r.id == rule.id) {
            return Err(StreamError::conflict(format!("Rule with ID '{}' already exists", rule.id)));
        }

        info!("Adding filter rule '{}' (priority {})", rule.id, rule.priority);
        self.rule_stats.insert(rule.id.clone(), RuleStatistics::default());
        rules.push(Arc::new(rule));
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(())
    }

    /// Replace a rule's definition. Its statistics carry over.
    pub fn update_rule(&self, rule_id: &str, rule: SmartFilterRule) -> Result<()> {
        if rule.id != rule_id {
            return Err(StreamError::validation(format!(
                "Rule ID '{}' does not match '{}'",
                rule.id, rule_id
            )));
        }
        self.validate_rule(&rule)?;

        let mut rules = self.rules.write();
        let slot = rules
            .iter_mut()
            .find(|r| r.id == rule_id)
            .ok_or_else(|| StreamError::not_found(format!("Rule with ID '{}' not found", rule_id)))?;
        *slot = Arc::new(rule);
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));

        info!("Updated filter rule '{}'", rule_id);
        Ok(())
    }

    pub fn remove_rule(&self, rule_id: &str) -> Result<()> {
        let mut rules = self.rules.write();
        let position = rules
            .iter()
            .position(|r| r.id == rule_id)
            .ok_or_else(|| StreamError::not_found(format!("Rule with ID '{}' not found", rule_id)))?;
        rules.remove(position);
        self.rule_stats.remove(rule_id);

        info!("Removed filter rule '{}'", rule_id);
        Ok(())
    }

    pub fn set_rule_enabled(&self, rule_id: &str, enabled: bool) -> Result<()> {
        let mut rules = self.rules.write();
        let slot = rules
            .iter_mut()
            .find(|r| r.id == rule_id)
            .ok_or_else(|| StreamError::not_found(format!("Rule with ID '{}' not found", rule_id)))?;
        let mut updated = (**slot).clone();
        updated.enabled = enabled;
        *slot = Arc::new(updated);

        info!("Filter rule '{}' {}", rule_id, if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    pub fn get_rule(&self, rule_id: &str) -> Option<SmartFilterRule> {
        self.rules.read().iter().find(|r| r.id == rule_id).map(|r| (**r).clone())
    }

    /// Rules in evaluation order.
    pub fn list_rules(&self) -> Vec<SmartFilterRule> {
        self.rules.read().iter().map(|r| (**r).clone()).collect()
    }

    pub fn get_rule_statistics(&self, rule_id: &str) -> Option<RuleStatistics> {
        self.rule_stats.get(rule_id).map(|s| s.clone())
    }

    pub fn get_statistics(&self) -> FilteringStatistics {
        let rules = self.rules.read();
        FilteringStatistics {
            total_rules: rules.len(),
            enabled_rules: rules.iter().filter(|r| r.enabled).count(),
            events_processed: self.events_processed.load(Ordering::Relaxed),
            events_blocked: self.events_blocked.load(Ordering::Relaxed),
            events_modified: self.events_modified.load(Ordering::Relaxed),
            alerts_raised: self.alerts_raised.load(Ordering::Relaxed),
            user_preferences: self.user_preferences.len(),
            cached_regexes: self.evaluator.cached_regex_count(),
            rules: self
                .rule_stats
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect(),
        }
    }

    pub fn set_user_preferences(&self, user_id: &str, preferences: UserFilterPreferences) -> Result<()> {
        if user_id.is_empty() {
            return Err(StreamError::validation("User ID cannot be empty"));
        }
        preferences.validate()?;
        self.user_preferences.insert(user_id.to_string(), preferences);
        debug!("Stored filter preferences for user {}", user_id);
        Ok(())
    }

    pub fn get_user_preferences(&self, user_id: &str) -> Option<UserFilterPreferences> {
        self.user_preferences.get(user_id).map(|p| p.clone())
    }

    pub fn remove_user_preferences(&self, user_id: &str) -> bool {
        self.user_preferences.remove(user_id).is_some()
    }

    pub fn log_statistics(&self) {
        let stats = self.get_statistics();
        info!(
            "Filter stats: {} events processed, {} blocked, {} modified, {} alerts, {}/{} rules enabled",
            stats.events_processed,
            stats.events_blocked,
            stats.events_modified,
            stats.alerts_raised,
            stats.enabled_rules,
            stats.total_rules
        );
        for (rule_id, rule_stats) in &stats.rules {
            debug!(
                "Rule {}: processed={} matched={} filtered={}",
                rule_id, rule_stats.events_processed, rule_stats.events_matched, rule_stats.events_filtered
            );
        }
    }

    pub fn spawn_stats_logger(engine: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = std::time::Duration::from_millis(engine.config.stats_log_interval_ms.max(1));
            let mut ticker = interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => engine.log_statistics(),
                }
            }
        })
    }
}

fn rule_blocks(rule: &SmartFilterRule) -> bool {
    rule.actions.iter().any(|a| matches!(a, FilterAction::Block))
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}
