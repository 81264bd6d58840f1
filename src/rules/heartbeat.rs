// src/rules/heartbeat.rs - Missing heartbeat detection
use crate::{
    alarm::{Alarm, Severity},
    error::{Result, WatcherError},
    remote_info::RemoteInfo,
    rule::{parse_config, Rule, RuleBase, RuleClass, SeverityUpdate},
    task::TaskSlot,
    topic_callback::TopicCallback,
    value::Sample,
};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const CLASS_NAME: &str = "Heartbeat";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatConfig {
    /// Source as `name` or `name:index`
    pub name: String,
    /// Seconds allowed between heartbeat events
    pub timeout: f64,
}

/// NONE while `evt_heartbeat` keeps arriving; SERIOUS once a heartbeat is
/// overdue. The alarm is named `Heartbeat.{name}:{index}`.
pub struct Heartbeat {
    base: RuleBase,
    timeout: Duration,
    reason: String,
    timer: Arc<Mutex<TaskSlot>>,
}

impl Heartbeat {
    pub fn new(config: HeartbeatConfig) -> Result<Self> {
        let info = RemoteInfo::from_name_index(&config.name, ["evt_heartbeat"], Vec::<&str>::new())?;
        let timeout = Duration::try_from_secs_f64(config.timeout)
            .ok()
            .filter(|t| !t.is_zero())
            .ok_or_else(|| {
                WatcherError::Config(format!(
                    "Heartbeat {}: timeout must be positive; got {}",
                    config.name, config.timeout
                ))
            })?;
        let name = format!("{}.{}", CLASS_NAME, info.key());
        Ok(Self {
            base: RuleBase::new(name, vec![info]),
            timeout,
            reason: format!("Heartbeat event not seen in {} seconds", config.timeout),
            timer: Arc::new(Mutex::new(TaskSlot::new("heartbeat timer"))),
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn restart_timer(&mut self) {
        let alarm = self.base.alarm().clone();
        let timeout = self.timeout;
        let reason = self.reason.clone();
        let slot = Arc::downgrade(&self.timer);
        self.timer.lock().spawn(move |generation| async move {
            tokio::time::sleep(timeout).await;
            if let Some(slot) = slot.upgrade() {
                expire(&slot, &alarm, reason, generation);
            }
        });
    }
}

/// Raise the alarm for a timer that ran to the end.
///
/// The slot stays locked through `set_severity`, so a heartbeat that restarts
/// the timer either lands before this check (and the stale generation is
/// dropped) or after the alarm was raised. Returns true if the alarm was set.
fn expire(slot: &Mutex<TaskSlot>, alarm: &Alarm, reason: String, generation: u64) -> bool {
    let mut slot = slot.lock();
    if !slot.is_current(generation) {
        debug!("{} timer generation {} superseded", alarm.name(), generation);
        return false;
    }
    slot.complete(generation);
    debug!("{} timed out", alarm.name());
    alarm.set_severity(Severity::Serious, reason);
    true
}

impl Rule for Heartbeat {
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
        self.restart_timer();
        Ok(SeverityUpdate::nominal())
    }

    fn start(&mut self) {
        self.restart_timer();
    }

    fn stop(&mut self) {
        self.timer.lock().cancel();
    }
}

fn schema() -> Option<Value> {
    Some(json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "description": "Configuration for Heartbeat",
        "type": "object",
        "properties": {
            "name": {
                "description": "Source name and index in the form `name` or `name:index`; the default index is 0",
                "type": "string"
            },
            "timeout": {
                "description": "Maximum allowed time between heartbeat events (sec)",
                "type": "number",
                "exclusiveMinimum": 0,
                "default": 3
            }
        },
        "required": ["name", "timeout"],
        "additionalProperties": false
    }))
}

fn build(config: Value) -> Result<Box<dyn Rule>> {
    let config: HeartbeatConfig = parse_config(CLASS_NAME, config)?;
    Ok(Box::new(Heartbeat::new(config)?))
}

pub fn class() -> RuleClass {
    RuleClass {
        name: CLASS_NAME,
        schema,
        build,
    }
}
