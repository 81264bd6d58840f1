// src/rules/enabled.rs - Source summary state monitoring
use crate::{
    alarm::Severity,
    error::Result,
    remote_info::RemoteInfo,
    rule::{parse_config, Rule, RuleBase, RuleClass, SeverityUpdate},
    topic_callback::TopicCallback,
    value::Sample,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;

pub const CLASS_NAME: &str = "Enabled";

/// Summary states reported on `evt_summaryState`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryState {
    Disabled = 1,
    Enabled = 2,
    Fault = 3,
    Offline = 4,
    Standby = 5,
}

impl SummaryState {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(SummaryState::Disabled),
            2 => Some(SummaryState::Enabled),
            3 => Some(SummaryState::Fault),
            4 => Some(SummaryState::Offline),
            5 => Some(SummaryState::Standby),
            _ => None,
        }
    }
}

impl fmt::Display for SummaryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SummaryState::Disabled => "DISABLED",
            SummaryState::Enabled => "ENABLED",
            SummaryState::Fault => "FAULT",
            SummaryState::Offline => "OFFLINE",
            SummaryState::Standby => "STANDBY",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnabledConfig {
    pub name: String,
    pub disabled_severity: Severity,
    pub standby_severity: Severity,
    pub offline_severity: Severity,
    pub fault_severity: Severity,
}

/// NONE while the source is ENABLED; a configured severity per other state.
/// The alarm is named `Enabled.{name}:{index}`.
pub struct Enabled {
    base: RuleBase,
    config: EnabledConfig,
}

impl Enabled {
    pub fn new(config: EnabledConfig) -> Result<Self> {
        let info = RemoteInfo::from_name_index(&config.name, ["evt_summaryState"], Vec::<&str>::new())?;
        let name = format!("{}.{}", CLASS_NAME, info.key());
        Ok(Self {
            base: RuleBase::new(name, vec![info]),
            config,
        })
    }

    fn severity_for(&self, state: SummaryState) -> Severity {
        match state {
            SummaryState::Enabled => Severity::None,
            SummaryState::Disabled => self.config.disabled_severity,
            SummaryState::Standby => self.config.standby_severity,
            SummaryState::Offline => self.config.offline_severity,
            SummaryState::Fault => self.config.fault_severity,
        }
    }
}

impl Rule for Enabled {
    fn base(&self) -> &RuleBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut RuleBase {
        &mut self.base
    }

    fn compute_alarm_severity(
        &mut self,
        data: &Sample,
        _topic_callback: &TopicCallback,
    ) -> Result<SeverityUpdate> {
        let code = data
            .get_int("summaryState")
            .ok_or_else(|| self.base.error(format!("no integer summaryState in {}", data)))?;
        let (state_name, severity) = match SummaryState::from_code(code) {
            Some(state) => (state.to_string(), self.severity_for(state)),
            None => (format!("{} unknown", code), self.config.fault_severity),
        };
        if severity == Severity::None {
            return Ok(SeverityUpdate::nominal());
        }
        Ok(SeverityUpdate::changed(severity, format!("{} state", state_name)))
    }
}

fn severity_property(state: &str, default: Severity) -> Value {
    json!({
        "description": format!("alarm severity for state {}", state),
        "type": "integer",
        "enum": Severity::ALL.iter().map(|s| s.code()).collect::<Vec<_>>(),
        "default": default.code()
    })
}

fn schema() -> Option<Value> {
    Some(json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "description": "Configuration for Enabled",
        "type": "object",
        "properties": {
            "name": {
                "description": "Source name and index in the form `name` or `name:index`; the default index is 0",
                "type": "string"
            },
            "disabled_severity": severity_property("DISABLED", Severity::None),
            "standby_severity": severity_property("STANDBY", Severity::None),
            "offline_severity": severity_property("OFFLINE", Severity::Serious),
            "fault_severity": severity_property("FAULT", Severity::Critical)
        },
        "required": ["name", "disabled_severity", "standby_severity", "offline_severity", "fault_severity"],
        "additionalProperties": false
    }))
}

fn build(config: Value) -> Result<Box<dyn Rule>> {
    let config: EnabledConfig = parse_config(CLASS_NAME, config)?;
    Ok(Box::new(Enabled::new(config)?))
}

pub fn class() -> RuleClass {
    RuleClass {
        name: CLASS_NAME,
        schema,
        build,
    }
}
