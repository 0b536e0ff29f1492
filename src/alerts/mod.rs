//! Threshold alerting over merged snapshots.
//!
//! Each rule watches one metric path and moves through `OK`, `WARNING` and
//! `CRITICAL` one step at a time, and only after a configured number of
//! consecutive samples agree. Transitions are the only output: they are
//! published as [`AlertEvent`]s on a broadcast channel.

pub mod evaluator;
pub mod logging_subscriber;
pub mod rules;

pub use evaluator::AlertEvaluator;
pub use rules::load_rules;

use crate::config::ConfigurationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertState {
    #[default]
    Ok,
    Warning,
    Critical,
}

impl AlertState {
    fn escalate(self) -> Self {
        match self {
            AlertState::Ok => AlertState::Warning,
            AlertState::Warning | AlertState::Critical => AlertState::Critical,
        }
    }

    fn step_down(self) -> Self {
        match self {
            AlertState::Critical => AlertState::Warning,
            AlertState::Warning | AlertState::Ok => AlertState::Ok,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertState::Ok => "OK",
            AlertState::Warning => "WARNING",
            AlertState::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for AlertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Comparison between an observed value and a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    #[serde(alias = "above", alias = ">")]
    Gt,
    #[serde(alias = ">=")]
    Ge,
    #[serde(alias = "below", alias = "<")]
    Lt,
    #[serde(alias = "<=")]
    Le,
}

impl Operator {
    pub fn breaches(&self, value: f64, threshold: f64) -> bool {
        match self {
            Operator::Gt => value > threshold,
            Operator::Ge => value >= threshold,
            Operator::Lt => value < threshold,
            Operator::Le => value <= threshold,
        }
    }

    fn is_upper_bound(&self) -> bool {
        matches!(self, Operator::Gt | Operator::Ge)
    }
}

fn default_hysteresis() -> u32 {
    3
}

/// One threshold rule as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRuleConfig {
    pub name: String,
    /// Dotted path into the merged snapshot; the first segment is the domain.
    pub metric: String,
    pub operator: Operator,
    /// Breaching this puts the rule in `WARNING`.
    pub threshold: f64,
    /// Breaching this puts the rule in `CRITICAL`. Without it, a sustained
    /// breach while in `WARNING` escalates to `CRITICAL`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critical_threshold: Option<f64>,
    /// Consecutive agreeing samples required for each transition.
    #[serde(default = "default_hysteresis")]
    pub hysteresis: u32,
}

impl AlertRuleConfig {
    fn invalid(&self, reason: impl Into<String>) -> ConfigurationError {
        ConfigurationError::InvalidRule {
            rule: self.name.clone(),
            reason: reason.into(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.name.trim().is_empty() {
            return Err(self.invalid("name must not be empty"));
        }
        let segments: Vec<&str> = self.metric.split('.').collect();
        if segments.len() < 2 || segments.iter().any(|s| s.is_empty()) {
            return Err(self.invalid(format!(
                "metric '{}' must be a dotted path starting with a domain, e.g. cpu.average.cpu_percent",
                self.metric
            )));
        }
        if self.hysteresis == 0 {
            return Err(self.invalid("hysteresis must be at least 1"));
        }
        if !self.threshold.is_finite() {
            return Err(self.invalid("threshold must be a finite number"));
        }
        if let Some(critical) = self.critical_threshold {
            if !critical.is_finite() {
                return Err(self.invalid("critical_threshold must be a finite number"));
            }
            let ordered = if self.operator.is_upper_bound() {
                critical >= self.threshold
            } else {
                critical <= self.threshold
            };
            if !ordered {
                return Err(self.invalid(
                    "critical_threshold must lie beyond threshold in the direction of the operator",
                ));
            }
        }
        Ok(())
    }

    /// The domain the metric path starts with.
    pub fn domain(&self) -> &str {
        self.metric.split('.').next().unwrap_or_default()
    }
}

/// A state change of one rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub rule: String,
    pub metric: String,
    pub old_state: AlertState,
    pub new_state: AlertState,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}
