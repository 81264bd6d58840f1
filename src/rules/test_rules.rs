// src/rules/test_rules.rs - Rules for exercising the engine without a live source
use crate::{
    alarm::Severity,
    error::{Result, WatcherError},
    rule::{parse_config, Rule, RuleBase, RuleClass, SeverityUpdate},
    task::TaskSlot,
    topic_callback::TopicCallback,
    value::Sample,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

// ============================================================================
// test.NoConfig
// ============================================================================

pub const NO_CONFIG_CLASS_NAME: &str = "test.NoConfig";

/// Takes no configuration and reads no topics
pub struct NoConfig {
    base: RuleBase,
}

impl NoConfig {
    pub fn new() -> Self {
        Self {
            base: RuleBase::new(NO_CONFIG_CLASS_NAME, Vec::new()),
        }
    }
}

impl Default for NoConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl Rule for NoConfig {
    fn base(&self) -> &RuleBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut RuleBase {
        &mut self.base
    }

    fn compute_alarm_severity(
        &mut self,
        _data: &Sample,
        _topic_callback: &TopicCallback,
    ) -> Result<SeverityUpdate> {
        Err(self.base.error("subscribes to no topics and should never be evaluated"))
    }
}

fn no_config_schema() -> Option<Value> {
    None
}

fn build_no_config(_config: Value) -> Result<Box<dyn Rule>> {
    Ok(Box::new(NoConfig::new()))
}

pub fn no_config_class() -> RuleClass {
    RuleClass {
        name: NO_CONFIG_CLASS_NAME,
        schema: no_config_schema,
        build: build_no_config,
    }
}

// ============================================================================
// test.ConfiguredSeverities
// ============================================================================

pub const CONFIGURED_SEVERITIES_CLASS_NAME: &str = "test.ConfiguredSeverities";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfiguredSeveritiesConfig {
    /// Last component of the rule name
    pub name: String,
    /// Seconds between severities
    pub interval: f64,
    /// Extra seconds before the first severity
    pub delay: f64,
    pub severities: Vec<Severity>,
    /// Passes through `severities`; 0 repeats forever
    pub repeats: u32,
}

/// Steps its alarm through a fixed list of severities from a background
/// task, started by `start` and cancelled by `stop`.
pub struct ConfiguredSeverities {
    base: RuleBase,
    interval: Duration,
    delay: Duration,
    severities: Vec<Severity>,
    repeats: u32,
    runner: TaskSlot,
}

impl ConfiguredSeverities {
    pub fn new(config: ConfiguredSeveritiesConfig) -> Result<Self> {
        let interval = Duration::try_from_secs_f64(config.interval)
            .ok()
            .filter(|d| !d.is_zero())
            .ok_or_else(|| WatcherError::Config(format!("interval must be positive; got {}", config.interval)))?;
        let delay = Duration::try_from_secs_f64(config.delay)
            .map_err(|_| WatcherError::Config(format!("delay must be non-negative; got {}", config.delay)))?;
        if config.severities.is_empty() {
            return Err(WatcherError::Config("severities must not be empty".to_string()));
        }
        Ok(Self {
            base: RuleBase::new(
                format!("{}.{}", CONFIGURED_SEVERITIES_CLASS_NAME, config.name),
                Vec::new(),
            ),
            interval,
            delay,
            severities: config.severities,
            repeats: config.repeats,
            runner: TaskSlot::new("configured severities"),
        })
    }
}

impl Rule for ConfiguredSeverities {
    fn base(&self) -> &RuleBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut RuleBase {
        &mut self.base
    }

    fn compute_alarm_severity(
        &mut self,
        _data: &Sample,
        _topic_callback: &TopicCallback,
    ) -> Result<SeverityUpdate> {
        Err(self.base.error("driven by its own task and should never be evaluated"))
    }

    fn start(&mut self) {
        let alarm = self.base.alarm().clone();
        let (interval, delay, repeats) = (self.interval, self.delay, self.repeats);
        let severities = self.severities.clone();
        self.runner.spawn(move |_| async move {
            tokio::time::sleep(delay).await;
            let mut repeat = 0;
            loop {
                for &severity in &severities {
                    tokio::time::sleep(interval).await;
                    alarm.set_severity(severity, "Commanded severity");
                }
                repeat += 1;
                if repeats > 0 && repeat >= repeats {
                    break;
                }
            }
            debug!("{} finished after {} passes", alarm.name(), repeat);
        });
    }

    fn stop(&mut self) {
        self.runner.cancel();
    }
}

fn configured_severities_schema() -> Option<Value> {
    Some(json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "description": "Configuration for ConfiguredSeverities",
        "type": "object",
        "properties": {
            "name": {"description": "Rule name (one field in a longer name)", "type": "string"},
            "interval": {"description": "Interval between severities (seconds)", "type": "number", "exclusiveMinimum": 0},
            "delay": {"description": "Additional delay before the first severity (seconds)", "type": "number", "minimum": 0, "default": 0},
            "severities": {
                "description": "Severities to step through, as codes or names",
                "type": "array",
                "items": {"type": ["integer", "string"]},
                "minItems": 1
            },
            "repeats": {"description": "How many times to repeat the pattern; 0 = forever", "type": "integer", "minimum": 0, "default": 0}
        },
        "required": ["name", "interval", "severities"],
        "additionalProperties": false
    }))
}

fn build_configured_severities(config: Value) -> Result<Box<dyn Rule>> {
    let config: ConfiguredSeveritiesConfig = parse_config(CONFIGURED_SEVERITIES_CLASS_NAME, config)?;
    Ok(Box::new(ConfiguredSeverities::new(config)?))
}

pub fn configured_severities_class() -> RuleClass {
    RuleClass {
        name: CONFIGURED_SEVERITIES_CLASS_NAME,
        schema: configured_severities_schema,
        build: build_configured_severities,
    }
}
