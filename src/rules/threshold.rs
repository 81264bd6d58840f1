// src/rules/threshold.rs - Polled measurement checked against severity levels
use crate::{
    alarm::{Alarm, Severity},
    error::{Result, WatcherError},
    polling::PollingLoop,
    remote_info::RemoteInfo,
    remote_wrapper::RemoteWrapper,
    rule::{parse_config, Rule, RuleBase, RuleClass, SeverityUpdate},
    topic_callback::TopicCallback,
    value::{Sample, Value},
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, trace};

pub const CLASS_NAME: &str = "Threshold";

/// Adjacent levels must be further apart than hysteresis times this
pub const HYSTERESIS_GROW_FACTOR: f64 = 1.1;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThresholdConfig {
    /// Source as `name` or `name:index`
    pub name: String,
    /// Poll topic
    pub topic: String,
    /// Scalar or array field; arrays are reduced to their worst finite element
    pub field: String,
    /// Seconds between polls
    pub poll_interval: f64,
    /// Seconds without a new sample before the alarm goes SERIOUS
    pub max_data_age: f64,
    pub warning_level: Option<f64>,
    pub serious_level: Option<f64>,
    pub critical_level: Option<f64>,
    pub hysteresis: f64,
    /// False if values below the levels are bad
    pub big_is_bad: bool,
    pub units: String,
}

// ============================================================================
// THRESHOLD HANDLER
// ============================================================================

/// Severity from one value and up to three levels, with hysteresis on the
/// way down.
///
/// Levels are stored scaled by -1 when small values are bad, so every
/// comparison is "scaled value above scaled level".
#[derive(Debug, Clone)]
pub struct ThresholdHandler {
    /// Most severe first
    levels: Vec<(Severity, f64)>,
    hysteresis: f64,
    scale: f64,
    value_name: String,
    units: String,
}

impl ThresholdHandler {
    pub fn new(config: &ThresholdConfig) -> Result<Self> {
        let invalid = |message: String| WatcherError::Config(format!("{} {}: {}", CLASS_NAME, config.name, message));
        if !config.hysteresis.is_finite() || config.hysteresis < 0.0 {
            return Err(invalid(format!(
                "hysteresis={} must be finite and non-negative",
                config.hysteresis
            )));
        }
        let scale = if config.big_is_bad { 1.0 } else { -1.0 };

        let mut levels = Vec::new();
        for (severity, level) in [
            (Severity::Critical, config.critical_level),
            (Severity::Serious, config.serious_level),
            (Severity::Warning, config.warning_level),
        ] {
            let Some(level) = level else { continue };
            if !level.is_finite() {
                return Err(invalid(format!("{} level {} must be finite", severity, level)));
            }
            levels.push((severity, level * scale));
        }
        if levels.is_empty() {
            return Err(invalid(
                "at least one of warning_level, serious_level or critical_level is required".to_string(),
            ));
        }

        let grown = config.hysteresis * HYSTERESIS_GROW_FACTOR;
        for pair in levels.windows(2) {
            let (higher, higher_level) = pair[0];
            let (lower, lower_level) = pair[1];
            if higher_level <= lower_level {
                return Err(invalid(format!(
                    "{} level {} and {} level {} are out of order",
                    lower,
                    lower_level * scale,
                    higher,
                    higher_level * scale
                )));
            }
            if higher_level - grown <= lower_level {
                return Err(invalid(format!(
                    "{} level {} and {} level {} are not separated by more than hysteresis {} * {}",
                    lower,
                    lower_level * scale,
                    higher,
                    higher_level * scale,
                    config.hysteresis,
                    HYSTERESIS_GROW_FACTOR
                )));
            }
        }

        Ok(Self {
            levels,
            hysteresis: config.hysteresis,
            scale,
            value_name: config.field.clone(),
            units: config.units.clone(),
        })
    }

    /// Severity and reason for `value`, given the alarm's current severity.
    ///
    /// A level is entered once the value passes it and left once the value
    /// falls back past the level less the hysteresis.
    pub fn severity_reason(&self, value: f64, current: Severity) -> SeverityUpdate {
        let scaled = value * self.scale;
        for &(severity, level) in &self.levels {
            if scaled > level {
                return SeverityUpdate::changed(severity, self.reason(value, level, false));
            }
            if current == severity && scaled > level - self.hysteresis {
                return SeverityUpdate::changed(severity, self.reason(value, level, true));
            }
        }
        SeverityUpdate::nominal()
    }

    fn reason(&self, value: f64, scaled_level: f64, with_hysteresis: bool) -> String {
        let units = if self.units.is_empty() {
            String::new()
        } else {
            format!(" {}", self.units)
        };
        let relation = if self.scale > 0.0 { ">" } else { "<" };
        let mut reason = format!(
            "{} {:.2}{} {} {:.2}",
            self.value_name,
            value,
            units,
            relation,
            scaled_level * self.scale
        );
        if with_hysteresis {
            let sign = if self.scale > 0.0 { "-" } else { "+" };
            reason.push_str(&format!(" {} hysteresis {:.2}", sign, self.hysteresis));
        }
        reason
    }
}

/// Worst finite reading in a scalar or array field
fn reduce(value: &Value, scale: f64) -> Option<f64> {
    let readings: Vec<f64> = match value {
        Value::Array(items) => items.iter().filter_map(Value::as_float).collect(),
        scalar => scalar.as_float().into_iter().collect(),
    };
    readings
        .into_iter()
        .filter(|v| v.is_finite())
        .max_by(|a, b| (a * scale).total_cmp(&(b * scale)))
}

// ============================================================================
// POLLER
// ============================================================================

/// State carried between polls. Data age counts from the last time the
/// polled sample changed, or from the start of polling if none was seen.
struct Poller {
    remote: Arc<RemoteWrapper>,
    topic: String,
    field: String,
    handler: Arc<ThresholdHandler>,
    alarm: Alarm,
    max_data_age: Duration,
    stale_reason: String,
    last: Option<Sample>,
    changed_at: Instant,
}

impl Poller {
    fn poll(&mut self) -> Result<SeverityUpdate> {
        let now = Instant::now();
        let sample = self.remote.get(&self.topic)?;
        if sample.is_some() && sample != self.last {
            self.last = sample;
            self.changed_at = now;
        }
        if now.duration_since(self.changed_at) > self.max_data_age {
            return Ok(SeverityUpdate::changed(Severity::Serious, self.stale_reason.clone()));
        }
        let Some(sample) = &self.last else {
            trace!("{}: no {} data yet", self.alarm.name(), self.topic);
            return Ok(SeverityUpdate::Unchanged);
        };
        let value = sample
            .get(&self.field)
            .and_then(|v| reduce(v, self.handler.scale))
            .ok_or_else(|| WatcherError::Rule {
                rule: self.alarm.name().to_string(),
                message: format!("{} has no finite {} in {}", self.topic, self.field, sample),
            })?;
        Ok(self.handler.severity_reason(value, self.alarm.severity()))
    }
}

// ============================================================================
// RULE
// ============================================================================

/// Polls one field of one topic and grades it against warning, serious and
/// critical levels. Goes SERIOUS when no new data arrives for
/// `max_data_age`. The alarm is named `Threshold.{name}:{index}.{field}`.
pub struct Threshold {
    base: RuleBase,
    config: ThresholdConfig,
    handler: Arc<ThresholdHandler>,
    max_data_age: Duration,
    polling: PollingLoop,
}

impl Threshold {
    pub fn new(config: ThresholdConfig) -> Result<Self> {
        let info = RemoteInfo::from_name_index(&config.name, Vec::<&str>::new(), [config.topic.as_str()])?;
        let seconds = |what: &str, value: f64| {
            Duration::try_from_secs_f64(value)
                .ok()
                .filter(|d| !d.is_zero())
                .ok_or_else(|| {
                    WatcherError::Config(format!(
                        "{} {}: {} must be positive; got {}",
                        CLASS_NAME, config.name, what, value
                    ))
                })
        };
        let poll_interval = seconds("poll_interval", config.poll_interval)?;
        let max_data_age = seconds("max_data_age", config.max_data_age)?;
        let handler = Arc::new(ThresholdHandler::new(&config)?);
        let name = format!("{}.{}.{}", CLASS_NAME, info.key(), config.field);
        Ok(Self {
            base: RuleBase::new(name, vec![info]),
            config,
            handler,
            max_data_age,
            polling: PollingLoop::new(poll_interval)?,
        })
    }

    pub fn handler(&self) -> &ThresholdHandler {
        &self.handler
    }

    fn poller(&self) -> Result<Poller> {
        let attr_name = self.base.remote_info_list()[0].attr_name();
        Ok(Poller {
            remote: self.base.shared_remote(&attr_name)?,
            topic: self.config.topic.clone(),
            field: self.config.field.clone(),
            handler: self.handler.clone(),
            alarm: self.base.alarm().clone(),
            max_data_age: self.max_data_age,
            stale_reason: format!(
                "No new {} data in {} seconds",
                self.config.topic, self.config.max_data_age
            ),
            last: None,
            changed_at: Instant::now(),
        })
    }
}

impl Rule for Threshold {
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
        Err(self.base.error("reads a poll topic and should never be evaluated"))
    }

    fn start(&mut self) {
        match self.poller() {
            Ok(mut poller) => self.polling.start(self.base.alarm().clone(), move || poller.poll()),
            Err(e) => error!("Cannot start {}: {}", self.name(), e),
        }
    }

    fn stop(&mut self) {
        self.polling.stop();
    }
}

fn schema() -> Option<serde_json::Value> {
    let level = |severity: &str| {
        json!({
            "description": format!("Level beyond which the alarm is {}; omit to skip it", severity),
            "type": "number"
        })
    };
    Some(json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "description": "Configuration for Threshold",
        "type": "object",
        "properties": {
            "name": {
                "description": "Source name and index in the form `name` or `name:index`; the default index is 0",
                "type": "string"
            },
            "topic": {"description": "Topic to poll", "type": "string"},
            "field": {"description": "Field to check; arrays use their worst finite element", "type": "string"},
            "poll_interval": {"description": "Time between polls (sec)", "type": "number", "exclusiveMinimum": 0, "default": 1},
            "max_data_age": {
                "description": "Maximum time without new data before the alarm goes SERIOUS (sec)",
                "type": "number",
                "exclusiveMinimum": 0,
                "default": 60
            },
            "warning_level": level("WARNING"),
            "serious_level": level("SERIOUS"),
            "critical_level": level("CRITICAL"),
            "hysteresis": {
                "description": "How far the value must recede past a level before the severity drops",
                "type": "number",
                "minimum": 0,
                "default": 0
            },
            "big_is_bad": {"description": "True if values above the levels are bad", "type": "boolean", "default": true},
            "units": {"description": "Units for the reason string", "type": "string", "default": ""}
        },
        "required": ["name", "topic", "field", "poll_interval", "max_data_age", "hysteresis", "big_is_bad", "units"],
        "anyOf": [
            {"required": ["warning_level"]},
            {"required": ["serious_level"]},
            {"required": ["critical_level"]}
        ],
        "additionalProperties": false
    }))
}

fn build(config: serde_json::Value) -> Result<Box<dyn Rule>> {
    let config: ThresholdConfig = parse_config(CLASS_NAME, config)?;
    Ok(Box::new(Threshold::new(config)?))
}

pub fn class() -> RuleClass {
    RuleClass {
        name: CLASS_NAME,
        schema,
        build,
    }
}
