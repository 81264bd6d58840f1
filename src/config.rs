// src/config.rs - Watcher configuration document
use crate::{
    alarm::{ResolvePolicy, Severity},
    config_schema,
    error::{Result, WatcherError},
    remote_info::SourceKey,
};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::info;

// ============================================================================
// TOP-LEVEL DOCUMENT
// ============================================================================

/// Top-level configuration: which rules to run and how alarms behave.
///
/// ```yaml
/// disabled_sources: [ATDome:1]
/// auto_acknowledge_delay: 3600
/// auto_unacknowledge_delay: 3600
/// rules:
///   - classname: Heartbeat
///     configs:
///       - name: ATDome
///         timeout: 5
/// escalation:
///   - alarms: ["Heartbeat.*"]
///     responder: night-crew
///     delay: 60
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WatcherConfig {
    /// Sources to skip, as `name` or `name:index`
    #[serde(default)]
    pub disabled_sources: Vec<String>,

    /// Seconds before an active, unacknowledged alarm is acknowledged
    /// automatically; 0 disables
    #[serde(default = "default_auto_delay")]
    pub auto_acknowledge_delay: f64,

    /// Seconds after returning to NONE before acknowledgment and escalation
    /// state is reset; 0 resets at once
    #[serde(default = "default_auto_delay")]
    pub auto_unacknowledge_delay: f64,

    pub rules: Vec<RuleSpec>,

    #[serde(default)]
    pub escalation: Vec<EscalationConfig>,

    /// Seconds allowed for one paging call
    #[serde(default = "default_escalation_timeout")]
    pub escalation_timeout: f64,

    #[serde(default)]
    pub escalation_retry: RetryConfig,
}

/// One rule class and the configs to instantiate it with
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSpec {
    pub classname: String,
    pub configs: Vec<serde_json::Value>,
}

/// Escalation policy for alarms whose names match one of `alarms`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EscalationConfig {
    /// Case-insensitive glob patterns (`*`, `?`)
    #[serde(default)]
    pub alarms: Vec<String>,

    /// Single-pattern form; merged with `alarms`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alarm_name_pattern: Option<String>,

    pub responder: String,

    /// Seconds an alarm must stay at or above `severity` before paging
    pub delay: f64,

    #[serde(default = "default_escalation_severity")]
    pub severity: Severity,

    #[serde(default)]
    pub resolve_on: ResolvePolicy,
}

/// Bounded retry with optional exponential backoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_true")]
    pub exponential_backoff: bool,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            exponential_backoff: true,
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl WatcherConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let document: serde_json::Value = serde_yaml::from_str(yaml)?;
        config_schema::validate("watcher configuration", &config_schema::watcher_config_schema(), &document)?;
        let config: WatcherConfig = serde_json::from_value(document)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_yaml(&contents)?;
        info!(
            "Loaded configuration from {} ({} rule classes)",
            path.display(),
            config.rules.len()
        );
        Ok(config)
    }

    /// Check constraints the schema cannot express
    pub fn validate(&self) -> Result<()> {
        seconds("auto_acknowledge_delay", self.auto_acknowledge_delay)?;
        seconds("auto_unacknowledge_delay", self.auto_unacknowledge_delay)?;
        if seconds("escalation_timeout", self.escalation_timeout)?.is_zero() {
            return Err(WatcherError::Config("escalation_timeout must be positive".to_string()));
        }
        if self.escalation_retry.max_attempts == 0 {
            return Err(WatcherError::Config(
                "escalation_retry.max_attempts must be at least 1".to_string(),
            ));
        }
        self.disabled_source_keys()?;
        for (i, entry) in self.escalation.iter().enumerate() {
            entry
                .validate()
                .map_err(|e| WatcherError::Config(format!("escalation[{}]: {}", i, e)))?;
        }
        Ok(())
    }

    pub fn disabled_source_keys(&self) -> Result<HashSet<SourceKey>> {
        self.disabled_sources
            .iter()
            .map(|name| SourceKey::parse(name))
            .collect()
    }

    pub fn auto_acknowledge(&self) -> Result<Duration> {
        seconds("auto_acknowledge_delay", self.auto_acknowledge_delay)
    }

    pub fn auto_unacknowledge(&self) -> Result<Duration> {
        seconds("auto_unacknowledge_delay", self.auto_unacknowledge_delay)
    }

    pub fn escalation_timeout(&self) -> Result<Duration> {
        seconds("escalation_timeout", self.escalation_timeout)
    }
}

impl EscalationConfig {
    /// All patterns, `alarms` first
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.alarms
            .iter()
            .map(String::as_str)
            .chain(self.alarm_name_pattern.as_deref())
    }

    pub fn delay(&self) -> Result<Duration> {
        seconds("delay", self.delay)
    }

    pub fn validate(&self) -> Result<()> {
        if self.responder.trim().is_empty() {
            return Err(WatcherError::Config("responder must not be empty".to_string()));
        }
        if self.delay()?.is_zero() {
            return Err(WatcherError::Config("delay must be positive".to_string()));
        }
        if self.severity == Severity::None {
            return Err(WatcherError::Config("severity must be above NONE".to_string()));
        }
        if self.patterns().next().is_none() {
            return Err(WatcherError::Config("no alarm name patterns".to_string()));
        }
        for pattern in self.patterns() {
            glob_to_regex(pattern)?;
        }
        Ok(())
    }
}

/// Compile a case-insensitive glob (`*`, `?`) into an anchored regex
pub fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut source = String::with_capacity(pattern.len() + 8);
    source.push('^');
    for c in pattern.chars() {
        match c {
            '*' => source.push_str(".*"),
            '?' => source.push('.'),
            other => source.push_str(&regex::escape(&other.to_string())),
        }
    }
    source.push('$');
    RegexBuilder::new(&source)
        .case_insensitive(true)
        .build()
        .map_err(|e| WatcherError::InvalidPattern {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })
}

fn seconds(field: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value).map_err(|_| {
        WatcherError::Config(format!(
            "{} must be a finite, non-negative number of seconds; got {}",
            field, value
        ))
    })
}

fn default_auto_delay() -> f64 { 3600.0 }
fn default_escalation_timeout() -> f64 { 5.0 }
fn default_escalation_severity() -> Severity { Severity::Critical }
fn default_max_attempts() -> u32 { 3 }
fn default_initial_delay_ms() -> u64 { 100 }
fn default_max_delay_ms() -> u64 { 5000 }
fn default_true() -> bool { true }
fn default_backoff_multiplier() -> f64 { 2.0 }
