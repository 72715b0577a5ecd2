//! Field conditions shared by channel filters and smart filter rules.
//!
//! Condition evaluation never panics on malformed rule data: every failure is
//! returned as an error, and the callers treat an erroring condition as a
//! non-match.

use dashmap::DashMap;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;

/// Compiled patterns kept before the cache is reset. Patterns from removed
/// rules and filters age out this way.
pub const MAX_CACHED_REGEXES: usize = 1024;

use crate::error::{Result, StreamError};
use crate::models::{extract_field, validate_field_path, Severity, StreamEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    Regex,
    GreaterThan,
    LessThan,
    In,
    NotIn,
    Exists,
    NotExists,
    MlSimilarity,
    TemporalPattern,
    GeospatialWithin,
}

impl ConditionOperator {
    fn requires_value(&self) -> bool {
        !matches!(self, ConditionOperator::Exists | ConditionOperator::NotExists)
    }

    pub fn is_analytic(&self) -> bool {
        matches!(
            self,
            ConditionOperator::MlSimilarity | ConditionOperator::TemporalPattern | ConditionOperator::GeospatialWithin
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCondition {
    /// Dotted path into the event view, e.g. `data.confidence`.
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(default)]
    pub negate: bool,
    #[serde(default)]
    pub case_sensitive: bool,
}

/// Channel filters use the same shape as rule conditions.
pub type AdvancedFilter = FilterCondition;

impl FilterCondition {
    pub fn new(field: impl Into<String>, operator: ConditionOperator, value: Option<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
            weight: None,
            negate: false,
            case_sensitive: false,
        }
    }

    pub fn equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, ConditionOperator::Equals, Some(value.into()))
    }

    pub fn exists(field: impl Into<String>) -> Self {
        Self::new(field, ConditionOperator::Exists, None)
    }

    pub fn weighted(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn negated(mut self) -> Self {
        self.negate = !self.negate;
        self
    }

    pub fn effective_weight(&self) -> f64 {
        self.weight.unwrap_or(1.0)
    }
}

/// Extension point for the analytic operators. Every method defaults to
/// "no match"; a real analytics backend overrides the ones it supports.
pub trait AnalyticEvaluator: Send + Sync {
    fn ml_similarity(&self, _event: &StreamEvent, _field_value: &Value, _reference: Option<&Value>) -> Result<bool> {
        Ok(false)
    }

    fn temporal_pattern(&self, _event: &StreamEvent, _field_value: &Value, _pattern: Option<&Value>) -> Result<bool> {
        Ok(false)
    }

    fn geospatial_within(&self, _event: &StreamEvent, _field_value: &Value, _area: Option<&Value>) -> Result<bool> {
        Ok(false)
    }
}

/// Placeholder backend: all analytic operators evaluate to false.
#[derive(Debug, Default)]
pub struct UnimplementedAnalytics;

impl AnalyticEvaluator for UnimplementedAnalytics {}

pub struct ConditionEvaluator {
    compiled_regexes: DashMap<String, Regex>,
    regex_size_limit: usize,
    analytics: Arc<dyn AnalyticEvaluator>,
}

impl ConditionEvaluator {
    pub fn new(regex_size_limit: usize) -> Self {
        Self::with_analytics(regex_size_limit, Arc::new(UnimplementedAnalytics))
    }

    pub fn with_analytics(regex_size_limit: usize, analytics: Arc<dyn AnalyticEvaluator>) -> Self {
        Self {
            compiled_regexes: DashMap::new(),
            regex_size_limit,
            analytics,
        }
    }

    /// Reject a condition that could never evaluate meaningfully.
    pub fn validate(&self, condition: &FilterCondition) -> Result<()> {
        validate_field_path(&condition.field)?;

        if let Some(weight) = condition.weight {
            if !weight.is_finite() || weight <= 0.0 {
                return Err(StreamError::validation(format!(
                    "Condition weight on '{}' must be a positive number",
                    condition.field
                )));
            }
        }

        if condition.operator.requires_value() && !condition.operator.is_analytic() && condition.value.is_none() {
            return Err(StreamError::validation(format!(
                "Operator {:?} on '{}' requires a value",
                condition.operator, condition.field
            )));
        }

        match condition.operator {
            ConditionOperator::In | ConditionOperator::NotIn => {
                if !matches!(condition.value, Some(Value::Array(_))) {
                    return Err(StreamError::validation(format!(
                        "Operator {:?} on '{}' requires an array value",
                        condition.operator, condition.field
                    )));
                }
            }
            ConditionOperator::Regex => {
                let pattern = condition.value.as_ref().and_then(|v| v.as_str()).ok_or_else(|| {
                    StreamError::validation(format!("Regex condition on '{}' requires a string pattern", condition.field))
                })?;
                self.get_or_compile_regex(pattern, condition.case_sensitive)?;
            }
            _ => {}
        }

        Ok(())
    }

    /// Evaluate a single condition, applying `negate`.
    pub fn evaluate(&self, condition: &FilterCondition, view: &Value, event: &StreamEvent) -> Result<bool> {
        let field_value = extract_field(view, &condition.field);
        let matched = self.evaluate_operator(condition, &field_value, event)?;
        Ok(matched != condition.negate)
    }

    /// Conjunctive match used by channel filters. An erroring condition is a non-match.
    pub fn matches_all(&self, conditions: &[FilterCondition], view: &Value, event: &StreamEvent) -> bool {
        conditions.iter().all(|condition| match self.evaluate(condition, view, event) {
            Ok(matched) => matched,
            Err(e) => {
                debug!("Condition on '{}' failed to evaluate: {}", condition.field, e);
                false
            }
        })
    }

    fn evaluate_operator(&self, condition: &FilterCondition, field_value: &Value, event: &StreamEvent) -> Result<bool> {
        let case_sensitive = condition.case_sensitive;
        let expected = condition.value.as_ref();

        match condition.operator {
            ConditionOperator::Equals => {
                let expected = require_value(condition)?;
                Ok(values_equal(field_value, expected, case_sensitive))
            }
            ConditionOperator::NotEquals => {
                let expected = require_value(condition)?;
                Ok(!values_equal(field_value, expected, case_sensitive))
            }
            ConditionOperator::Contains => {
                let expected = require_value(condition)?;
                Ok(contains(field_value, expected, case_sensitive))
            }
            ConditionOperator::NotContains => {
                let expected = require_value(condition)?;
                Ok(!contains(field_value, expected, case_sensitive))
            }
            ConditionOperator::Regex => {
                let pattern = require_value(condition)?
                    .as_str()
                    .ok_or_else(|| StreamError::evaluation("Regex pattern must be a string"))?;
                let regex = self.get_or_compile_regex(pattern, case_sensitive)?;
                Ok(match field_value {
                    Value::String(s) => regex.is_match(s),
                    Value::Null => false,
                    other => regex.is_match(&other.to_string()),
                })
            }
            ConditionOperator::GreaterThan => {
                let expected = require_value(condition)?;
                Ok(compare_ordered(field_value, expected, case_sensitive) == Some(Ordering::Greater))
            }
            ConditionOperator::LessThan => {
                let expected = require_value(condition)?;
                Ok(compare_ordered(field_value, expected, case_sensitive) == Some(Ordering::Less))
            }
            ConditionOperator::In => {
                let array = require_value(condition)?
                    .as_array()
                    .ok_or_else(|| StreamError::evaluation("'in' requires an array value"))?;
                Ok(array.iter().any(|v| values_equal(field_value, v, case_sensitive)))
            }
            ConditionOperator::NotIn => {
                let array = require_value(condition)?
                    .as_array()
                    .ok_or_else(|| StreamError::evaluation("'not_in' requires an array value"))?;
                Ok(!array.iter().any(|v| values_equal(field_value, v, case_sensitive)))
            }
            ConditionOperator::Exists => Ok(!field_value.is_null()),
            ConditionOperator::NotExists => Ok(field_value.is_null()),
            ConditionOperator::MlSimilarity => self.analytics.ml_similarity(event, field_value, expected),
            ConditionOperator::TemporalPattern => self.analytics.temporal_pattern(event, field_value, expected),
            ConditionOperator::GeospatialWithin => self.analytics.geospatial_within(event, field_value, expected),
        }
    }

    fn get_or_compile_regex(&self, pattern: &str, case_sensitive: bool) -> Result<Regex> {
        let key = if case_sensitive {
            pattern.to_string()
        } else {
            format!("(?i){}", pattern)
        };

        if let Some(regex) = self.compiled_regexes.get(&key) {
            return Ok(regex.clone());
        }

        let regex = RegexBuilder::new(pattern)
            .case_insensitive(!case_sensitive)
            .size_limit(self.regex_size_limit)
            .build()
            .map_err(|e| StreamError::validation(format!("Invalid regex pattern '{}': {}", pattern, e)))?;

        if self.compiled_regexes.len() >= MAX_CACHED_REGEXES {
            debug!("Regex cache full ({} patterns), clearing", self.compiled_regexes.len());
            self.compiled_regexes.clear();
        }
        self.compiled_regexes.insert(key, regex.clone());
        Ok(regex)
    }

    pub fn cached_regex_count(&self) -> usize {
        self.compiled_regexes.len()
    }
}

fn require_value(condition: &FilterCondition) -> Result<&Value> {
    condition
        .value
        .as_ref()
        .ok_or_else(|| StreamError::evaluation(format!("Condition on '{}' has no value", condition.field)))
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn as_severity(value: &Value) -> Option<Severity> {
    value.as_str().and_then(Severity::parse)
}

fn values_equal(a: &Value, b: &Value, case_sensitive: bool) -> bool {
    match (a, b) {
        (Value::String(a_str), Value::String(b_str)) => {
            if case_sensitive {
                a_str == b_str
            } else {
                a_str.to_lowercase() == b_str.to_lowercase()
            }
        }
        (Value::Number(_), _) | (_, Value::Number(_)) => match (as_number(a), as_number(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
        _ => a == b,
    }
}

fn contains(field_value: &Value, expected: &Value, case_sensitive: bool) -> bool {
    match (field_value, expected) {
        (Value::Array(items), _) => items.iter().any(|item| values_equal(item, expected, case_sensitive)),
        (Value::String(haystack), Value::String(needle)) => {
            if case_sensitive {
                haystack.contains(needle.as_str())
            } else {
                haystack.to_lowercase().contains(&needle.to_lowercase())
            }
        }
        _ => false,
    }
}

fn compare_ordered(a: &Value, b: &Value, case_sensitive: bool) -> Option<Ordering> {
    if a.is_null() || b.is_null() {
        return None;
    }
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x.partial_cmp(&y);
    }
    if let (Some(x), Some(y)) = (as_severity(a), as_severity(b)) {
        return Some(x.cmp(&y));
    }
    match (a, b) {
        (Value::String(a_str), Value::String(b_str)) => {
            if case_sensitive {
                Some(a_str.cmp(b_str))
            } else {
                Some(a_str.to_lowercase().cmp(&b_str.to_lowercase()))
            }
        }
        _ => None,
    }
}
