// src/rules/redundant_measurement.rs - Redundant sensors multiplexed on one topic
use crate::{
    alarm::Severity,
    error::{Result, WatcherError},
    filtered_topic_wrapper::{FilterKey, FilteredTopicWrapper},
    model::Wiring,
    remote_info::RemoteInfo,
    rule::{parse_config, Rule, RuleBase, RuleClass, SeverityUpdate},
    topic_callback::TopicCallback,
    value::{Sample, TopicKey},
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::trace;

pub const CLASS_NAME: &str = "RedundantMeasurement";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedundantMeasurementConfig {
    pub source: String,
    pub index: u32,
    /// Callback topic carrying every instance
    pub topic: String,
    /// Measured field
    pub field: String,
    /// Field identifying the instance
    pub filter_field: String,
    pub instances: Vec<i64>,
    /// A reading must be strictly above this to count as good
    pub minimum: f64,
    pub one_severity: Severity,
    pub none_severity: Severity,
}

/// Watches several instances of one measurement published on a single topic
/// and keyed by `filter_field`. NONE with at least two good instances,
/// `one_severity` with exactly one, `none_severity` with none.
pub struct RedundantMeasurement {
    base: RuleBase,
    config: RedundantMeasurementConfig,
    topic: TopicKey,
    wrapper: Option<Arc<FilteredTopicWrapper>>,
}

impl RedundantMeasurement {
    pub fn new(config: RedundantMeasurementConfig) -> Result<Self> {
        for severity in [config.one_severity, config.none_severity] {
            if severity == Severity::None {
                return Err(WatcherError::InvalidSeverity(format!(
                    "{}: one_severity and none_severity must be above NONE",
                    CLASS_NAME
                )));
            }
        }
        let info = RemoteInfo::new(
            config.source.clone(),
            config.index,
            [config.topic.clone()],
            Vec::<String>::new(),
        )?;
        let topic = info.topic_key(&config.topic);
        let name = format!("{}.{}.{}", CLASS_NAME, info.key(), config.field);
        Ok(Self {
            base: RuleBase::new(name, vec![info]),
            config,
            topic,
            wrapper: None,
        })
    }

    /// Latest reading of one instance; `None` if unseen or missing the field
    fn reading(&self, wrapper: &FilteredTopicWrapper, instance: i64) -> Option<f64> {
        wrapper
            .get_data(&FilterKey::Int(instance))
            .and_then(|sample| sample.get_float(&self.config.field))
    }

    fn is_good(&self, reading: Option<f64>) -> bool {
        matches!(reading, Some(value) if !value.is_nan() && value > self.config.minimum)
    }
}

impl Rule for RedundantMeasurement {
    fn base(&self) -> &RuleBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut RuleBase {
        &mut self.base
    }

    fn setup(&mut self, wiring: &mut Wiring<'_>) -> Result<()> {
        let wrapper = wiring.filtered_topic_wrapper(&self.topic, &self.config.filter_field, None)?;
        self.wrapper = Some(wrapper);
        Ok(())
    }

    fn compute_alarm_severity(
        &mut self,
        data: &Sample,
        _topic_callback: &TopicCallback,
    ) -> Result<SeverityUpdate> {
        let wrapper = self
            .wrapper
            .clone()
            .ok_or_else(|| self.base.error("filtered topic wrapper was never set up"))?;

        let instance = data.get_int(&self.config.filter_field);
        if !instance.is_some_and(|i| self.config.instances.contains(&i)) {
            trace!("{}: ignoring sample {}", self.name(), data);
            return Ok(SeverityUpdate::Unchanged);
        }

        let readings: Vec<(i64, Option<f64>)> = self
            .config
            .instances
            .iter()
            .map(|&i| (i, self.reading(&wrapper, i)))
            .collect();
        let good = readings.iter().filter(|(_, r)| self.is_good(*r)).count();

        let severity = match good {
            0 => self.config.none_severity,
            1 => self.config.one_severity,
            _ => return Ok(SeverityUpdate::nominal()),
        };
        let listing = readings
            .iter()
            .map(|(i, r)| match r {
                Some(value) => format!("{}={}", i, value),
                None => format!("{}=none", i),
            })
            .collect::<Vec<_>>()
            .join(", ");
        Ok(SeverityUpdate::changed(
            severity,
            format!(
                "{} of {} {} readings above {}: {}",
                good,
                readings.len(),
                self.config.field,
                self.config.minimum,
                listing
            ),
        ))
    }
}

fn schema() -> Option<Value> {
    Some(json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "description": "Configuration for RedundantMeasurement",
        "type": "object",
        "properties": {
            "source": {"description": "Source name", "type": "string", "minLength": 1},
            "index": {"description": "Source index", "type": "integer", "minimum": 0, "default": 0},
            "topic": {"description": "Callback topic carrying every instance", "type": "string"},
            "field": {"description": "Measured field", "type": "string"},
            "filter_field": {
                "description": "Field identifying the instance",
                "type": "string",
                "default": "salIndex"
            },
            "instances": {
                "description": "Values of filter_field to watch",
                "type": "array",
                "items": {"type": "integer"},
                "minItems": 2,
                "uniqueItems": true,
                "default": [1, 2]
            },
            "minimum": {
                "description": "A reading must be above this to count as good",
                "type": "number",
                "default": 9000
            },
            "one_severity": {
                "description": "Severity when exactly one instance is good",
                "type": ["integer", "string"],
                "default": 2
            },
            "none_severity": {
                "description": "Severity when no instance is good",
                "type": ["integer", "string"],
                "default": 4
            }
        },
        "required": ["source", "index", "topic", "field", "filter_field", "instances", "minimum", "one_severity", "none_severity"],
        "additionalProperties": false
    }))
}

fn build(config: Value) -> Result<Box<dyn Rule>> {
    let config: RedundantMeasurementConfig = parse_config(CLASS_NAME, config)?;
    Ok(Box::new(RedundantMeasurement::new(config)?))
}

pub fn class() -> RuleClass {
    RuleClass {
        name: CLASS_NAME,
        schema,
        build,
    }
}
