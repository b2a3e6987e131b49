//! Per-action rate limit rules.
//!
//! Rules map an action name (`"register"`, `"post_like"`, ...) to the window
//! and request budget applied to every subject performing that action.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use super::sliding::LimitConfig;
use crate::error::{LatchkeyError, Result};

/// A set of rules keyed by action, with an optional fallback.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitRules {
    /// Rule for actions without an entry of their own
    #[serde(default)]
    pub default: Option<LimitRule>,
    /// Map of action name to rule
    #[serde(default)]
    pub actions: HashMap<String, LimitRule>,
}

/// A limit rule: `max_requests` per `units` × `unit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitRule {
    /// Number of requests allowed per window
    pub max_requests: u64,
    /// The time unit
    pub unit: TimeUnit,
    /// Window length in units
    #[serde(default = "default_units")]
    pub units: u32,
    /// Optional name/description for this limit
    #[serde(default)]
    pub name: Option<String>,
}

fn default_units() -> u32 {
    1
}

/// Time unit for rule windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

impl LimitRule {
    pub fn window(&self) -> Duration {
        self.unit.duration() * self.units.max(1)
    }
}

impl From<&LimitRule> for LimitConfig {
    fn from(rule: &LimitRule) -> Self {
        LimitConfig {
            window_size: rule.window(),
            max_requests: rule.max_requests,
        }
    }
}

impl LimitRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let rules: Self = serde_yaml::from_str(yaml)
            .map_err(|e| LatchkeyError::Config(format!("Failed to parse rate limit rules: {}", e)))?;

        if let Some(rule) = &rules.default {
            validate("default", rule)?;
        }
        for (action, rule) in &rules.actions {
            validate(action, rule)?;
        }
        Ok(rules)
    }

    /// Add or replace the rule for `action`.
    pub fn insert(&mut self, action: impl Into<String>, rule: LimitRule) {
        self.actions.insert(action.into(), rule);
    }

    /// The rule for `action`, falling back to the default rule.
    pub fn find(&self, action: &str) -> Option<&LimitRule> {
        self.actions.get(action).or(self.default.as_ref())
    }
}

fn validate(action: &str, rule: &LimitRule) -> Result<()> {
    if rule.max_requests == 0 {
        return Err(LatchkeyError::Config(format!(
            "Rule for '{}' allows no requests",
            action
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rules() {
        let yaml = r#"
default:
  max_requests: 100
  unit: minute
actions:
  register:
    max_requests: 3
    unit: hour
    name: signups
  post_like:
    max_requests: 10
    unit: second
    units: 30
"#;
        let rules = LimitRules::from_yaml(yaml).unwrap();
        assert_eq!(rules.actions.len(), 2);

        let register = rules.find("register").unwrap();
        assert_eq!(register.max_requests, 3);
        assert_eq!(register.window(), Duration::from_secs(3600));
        assert_eq!(register.name.as_deref(), Some("signups"));

        let like = LimitConfig::from(rules.find("post_like").unwrap());
        assert_eq!(like.window_size, Duration::from_secs(30));
        assert_eq!(like.max_requests, 10);
    }

    #[test]
    fn test_find_falls_back_to_default() {
        let yaml = r#"
default:
  max_requests: 50
  unit: second
"#;
        let rules = LimitRules::from_yaml(yaml).unwrap();
        assert_eq!(rules.find("anything").unwrap().max_requests, 50);
        assert!(LimitRules::new().find("anything").is_none());
    }

    #[test]
    fn test_rejects_empty_budget() {
        let yaml = r#"
actions:
  comment:
    max_requests: 0
    unit: minute
"#;
        assert!(matches!(
            LimitRules::from_yaml(yaml),
            Err(LatchkeyError::Config(_))
        ));
    }

    #[test]
    fn test_rejects_unknown_unit() {
        let yaml = r#"
actions:
  comment:
    max_requests: 5
    unit: fortnight
"#;
        assert!(LimitRules::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_time_unit_durations() {
        assert_eq!(TimeUnit::Second.duration(), Duration::from_secs(1));
        assert_eq!(TimeUnit::Minute.duration(), Duration::from_secs(60));
        assert_eq!(TimeUnit::Hour.duration(), Duration::from_secs(3600));
        assert_eq!(TimeUnit::Day.duration(), Duration::from_secs(86400));
    }
}
