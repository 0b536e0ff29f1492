//! Loading alert rules from configuration and YAML rule files.

use super::AlertRuleConfig;
use crate::config::{AlertsConfig, ConfigurationError};
use itertools::Itertools;
use std::fs;
use tracing::debug;

/// Collects inline rules and the rules of every rule file, rejecting
/// duplicate names and invalid rules. Nothing is returned unless every rule
/// is valid.
pub fn load_rules(config: &AlertsConfig) -> Result<Vec<AlertRuleConfig>, ConfigurationError> {
    let mut all_rules = config.rules.clone();
    for file_path in &config.rule_files {
        let file_content =
            fs::read_to_string(file_path).map_err(|e| ConfigurationError::RuleFile {
                path: file_path.clone(),
                reason: e.to_string(),
            })?;

        let rules: Vec<AlertRuleConfig> =
            serde_yml::from_str(&file_content).map_err(|e| ConfigurationError::RuleFile {
                path: file_path.clone(),
                reason: format!("invalid YAML: {}", e),
            })?;
        debug!(path = %file_path.display(), count = rules.len(), "Loaded alert rule file");
        all_rules.extend(rules);
    }

    for rule in &all_rules {
        rule.validate()?;
    }

    all_rules.sort_by(|a, b| a.name.cmp(&b.name));
    for (name, group) in &all_rules.iter().chunk_by(|r| r.name.clone()) {
        if group.count() > 1 {
            return Err(ConfigurationError::DuplicateRule(name));
        }
    }

    Ok(all_rules)
}
