//! The per-rule alert state machine.
//!
//! For every sample a rule computes the severity the value calls for:
//!
//! | value breaches            | severity                          |
//! |---------------------------|-----------------------------------|
//! | nothing                   | `OK`                              |
//! | `threshold` only          | `WARNING`                         |
//! | `critical_threshold`      | `CRITICAL`                        |
//! | `threshold`, no critical  | `CRITICAL` (escalation)           |
//!
//! A severity above the current state counts toward an escalation, one below
//! it toward a step down, and an equal one resets both counts. When a count
//! reaches the rule's hysteresis, the state moves exactly one step and the
//! count restarts.

use super::{AlertEvent, AlertRuleConfig, AlertState};
use crate::core::{MetricSnapshot, MetricValue};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone)]
struct RuleState {
    rule: AlertRuleConfig,
    state: AlertState,
    escalating: u32,
    recovering: u32,
    last_transition: Option<DateTime<Utc>>,
    // Capture time of the domain sample last evaluated, so a domain that did
    // not refresh between two snapshots is not counted twice.
    last_sample: Option<DateTime<Utc>>,
}

impl RuleState {
    fn new(rule: AlertRuleConfig) -> Self {
        Self {
            rule,
            state: AlertState::Ok,
            escalating: 0,
            recovering: 0,
            last_transition: None,
            last_sample: None,
        }
    }

    fn severity(&self, value: f64) -> AlertState {
        let rule = &self.rule;
        if let Some(critical) = rule.critical_threshold {
            if rule.operator.breaches(value, critical) {
                return AlertState::Critical;
            }
            if rule.operator.breaches(value, rule.threshold) {
                return AlertState::Warning;
            }
            return AlertState::Ok;
        }
        if rule.operator.breaches(value, rule.threshold) {
            AlertState::Critical
        } else {
            AlertState::Ok
        }
    }

    /// Feeds one observation; returns the new state if it changed.
    fn observe(&mut self, value: f64) -> Option<AlertState> {
        let target = self.severity(value);
        let hysteresis = self.rule.hysteresis.max(1);

        if target > self.state {
            self.recovering = 0;
            self.escalating += 1;
            if self.escalating >= hysteresis {
                self.escalating = 0;
                self.state = self.state.escalate();
                return Some(self.state);
            }
        } else if target < self.state {
            self.escalating = 0;
            self.recovering += 1;
            if self.recovering >= hysteresis {
                self.recovering = 0;
                self.state = self.state.step_down();
                return Some(self.state);
            }
        } else {
            self.escalating = 0;
            self.recovering = 0;
        }
        None
    }
}

/// Evaluates a set of rules against successive snapshots.
#[derive(Debug, Clone, Default)]
pub struct AlertEvaluator {
    rules: Vec<RuleState>,
}

impl AlertEvaluator {
    /// Starts every rule in `OK`.
    pub fn new(rules: Vec<AlertRuleConfig>) -> Self {
        Self {
            rules: rules.into_iter().map(RuleState::new).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn state_of(&self, rule: &str) -> Option<AlertState> {
        self.rules
            .iter()
            .find(|r| r.rule.name == rule)
            .map(|r| r.state)
    }

    /// When the rule last changed state.
    pub fn last_transition(&self, rule: &str) -> Option<DateTime<Utc>> {
        self.rules
            .iter()
            .find(|r| r.rule.name == rule)
            .and_then(|r| r.last_transition)
    }

    /// Applies one snapshot and returns the transitions it caused.
    ///
    /// A rule whose metric is missing or textual, or whose domain has not
    /// been resampled since the previous call, is left untouched.
    pub fn evaluate(&mut self, snapshot: &MetricSnapshot) -> Vec<AlertEvent> {
        let mut events = Vec::new();
        for rule in &mut self.rules {
            let Some(sample) = snapshot.domains.get(rule.rule.domain()) else {
                continue;
            };
            if rule.last_sample == Some(sample.captured_at) {
                continue;
            }
            let value = match snapshot.lookup(&rule.rule.metric) {
                Some(MetricValue::Text(_)) | None => continue,
                Some(value) => value.as_f64(),
            };
            let Some(value) = value else { continue };
            rule.last_sample = Some(sample.captured_at);

            let old_state = rule.state;
            if let Some(new_state) = rule.observe(value) {
                rule.last_transition = Some(sample.captured_at);
                metrics::counter!(
                    "alert_transitions_total",
                    "rule" => rule.rule.name.clone(),
                    "state" => new_state.as_str()
                )
                .increment(1);
                events.push(AlertEvent {
                    rule: rule.rule.name.clone(),
                    metric: rule.rule.metric.clone(),
                    old_state,
                    new_state,
                    value,
                    timestamp: sample.captured_at,
                });
            }
        }
        events
    }

    /// Evaluates every published snapshot and broadcasts transitions. A new
    /// rule set from `rules_rx` replaces the current one and restarts every
    /// rule in `OK`.
    #[instrument(skip_all)]
    pub async fn run(
        mut self,
        mut snapshots: watch::Receiver<Arc<MetricSnapshot>>,
        mut rules_rx: watch::Receiver<Arc<Vec<AlertRuleConfig>>>,
        events_tx: broadcast::Sender<AlertEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!(rules = self.len(), "Alert evaluator started.");
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    info!("Alert evaluator received shutdown signal.");
                    break;
                }
                Ok(()) = rules_rx.changed() => {
                    let rules = rules_rx.borrow_and_update().clone();
                    info!(rules = rules.len(), "Alert rules reloaded, state reset.");
                    self = AlertEvaluator::new(rules.as_ref().clone());
                }
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        warn!("Snapshot channel closed, alert evaluator stopping.");
                        break;
                    }
                    let snapshot = snapshots.borrow_and_update().clone();
                    for event in self.evaluate(&snapshot) {
                        // No receivers is fine; transitions are still counted.
                        if events_tx.send(event).is_err() {
                            debug!("No alert subscribers.");
                        }
                    }
                }
            }
        }
        info!("Alert evaluator finished.");
    }
}
