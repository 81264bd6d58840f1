// src/rule.rs - Rule trait, shared rule state and the rule class registry
use crate::{
    alarm::{Alarm, Severity},
    config_schema::validate_rule_config,
    error::{Result, WatcherError},
    model::Wiring,
    remote_info::{RemoteInfo, SourceKey},
    remote_wrapper::RemoteWrapper,
    topic_callback::TopicCallback,
    value::Sample,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

// ============================================================================
// EVALUATION RESULT
// ============================================================================

/// Outcome of one rule evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeverityUpdate {
    /// Leave the alarm untouched
    Unchanged,
    /// Forward to `Alarm::set_severity`
    Changed(Severity, String),
}

impl SeverityUpdate {
    /// NONE with an empty reason
    pub fn nominal() -> Self {
        SeverityUpdate::Changed(Severity::None, String::new())
    }

    pub fn changed(severity: Severity, reason: impl Into<String>) -> Self {
        SeverityUpdate::Changed(severity, reason.into())
    }
}

// ============================================================================
// RULE TRAIT
// ============================================================================

/// State every rule carries: its unique name, what it subscribes to, the
/// alarm it owns and the remote wrappers attached during wiring.
pub struct RuleBase {
    name: String,
    remote_info_list: Vec<RemoteInfo>,
    alarm: Alarm,
    remotes: HashMap<String, Arc<RemoteWrapper>>,
}

impl RuleBase {
    pub fn new(name: impl Into<String>, remote_info_list: Vec<RemoteInfo>) -> Self {
        let name = name.into();
        Self {
            alarm: Alarm::new(name.clone()),
            name,
            remote_info_list,
            remotes: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn alarm(&self) -> &Alarm {
        &self.alarm
    }

    pub fn remote_info_list(&self) -> &[RemoteInfo] {
        &self.remote_info_list
    }

    pub fn attach_remote(&mut self, remote: Arc<RemoteWrapper>) {
        self.remotes.insert(remote.attr_name(), remote);
    }

    /// Remote wrapper by attribute name (`lowercase(source)_index`)
    pub fn remote(&self, attr_name: &str) -> Result<&RemoteWrapper> {
        self.remotes
            .get(attr_name)
            .map(|r| r.as_ref())
            .ok_or_else(|| WatcherError::Rule {
                rule: self.name.clone(),
                message: format!("no remote wrapper {}", attr_name),
            })
    }

    /// Owned handle to a remote wrapper, for background tasks
    pub fn shared_remote(&self, attr_name: &str) -> Result<Arc<RemoteWrapper>> {
        self.remotes.get(attr_name).cloned().ok_or_else(|| WatcherError::Rule {
            rule: self.name.clone(),
            message: format!("no remote wrapper {}", attr_name),
        })
    }

    /// Shorthand for a `Rule` error tagged with this rule's name
    pub fn error(&self, message: impl Into<String>) -> WatcherError {
        WatcherError::Rule {
            rule: self.name.clone(),
            message: message.into(),
        }
    }
}

/// Pluggable unit mapping samples to one alarm's severity.
///
/// Implementations hold a [`RuleBase`] and implement
/// `compute_alarm_severity`; everything else has defaults. Background work
/// started in `start` must be cancelled by `stop`, and `stop` must be safe
/// to call repeatedly.
pub trait Rule: Send {
    fn base(&self) -> &RuleBase;

    fn base_mut(&mut self) -> &mut RuleBase;

    /// Evaluate a sample delivered on one of this rule's callback topics
    fn compute_alarm_severity(
        &mut self,
        data: &Sample,
        topic_callback: &TopicCallback,
    ) -> Result<SeverityUpdate>;

    /// Extra wiring, such as filtered topic wrappers
    fn setup(&mut self, _wiring: &mut Wiring<'_>) -> Result<()> {
        Ok(())
    }

    fn start(&mut self) {}

    fn stop(&mut self) {}

    fn name(&self) -> &str {
        self.base().name()
    }

    fn alarm(&self) -> &Alarm {
        self.base().alarm()
    }

    fn remote_info_list(&self) -> &[RemoteInfo] {
        self.base().remote_info_list()
    }

    /// False if any source this rule reads is disabled
    fn is_usable(&self, disabled_sources: &HashSet<SourceKey>) -> bool {
        self.remote_info_list()
            .iter()
            .all(|info| !disabled_sources.contains(info.key()))
    }
}

/// A rule shared between the model and the topic callbacks that run it
pub type SharedRule = Arc<Mutex<Box<dyn Rule>>>;

// ============================================================================
// RULE CLASSES
// ============================================================================

/// Constructor for one rule class, registered under a namespaced name
#[derive(Clone, Copy)]
pub struct RuleClass {
    pub name: &'static str,
    /// JSON schema for the config, or `None` for rules without config
    pub schema: fn() -> Option<serde_json::Value>,
    pub build: fn(serde_json::Value) -> Result<Box<dyn Rule>>,
}

/// Static table of rule classes, keyed by name (e.g. `"Heartbeat"`,
/// `"test.NoConfig"`)
#[derive(Default, Clone)]
pub struct RuleRegistry {
    classes: BTreeMap<&'static str, RuleClass>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in rule class
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for class in crate::rules::builtin_classes() {
            registry.classes.insert(class.name, class);
        }
        registry
    }

    pub fn register(&mut self, class: RuleClass) -> Result<()> {
        if self.classes.contains_key(class.name) {
            return Err(WatcherError::Config(format!(
                "rule class {} registered twice",
                class.name
            )));
        }
        self.classes.insert(class.name, class);
        Ok(())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.classes.keys().copied().collect()
    }

    pub fn get(&self, classname: &str) -> Result<&RuleClass> {
        self.classes
            .get(classname)
            .ok_or_else(|| WatcherError::UnknownRule {
                classname: classname.to_string(),
                available: self.names().join(", "),
            })
    }

    /// Validate `raw_config` against the class schema and build the rule
    pub fn create(&self, classname: &str, raw_config: &serde_json::Value) -> Result<Box<dyn Rule>> {
        let class = self.get(classname)?;
        let config = match (class.schema)() {
            Some(schema) => validate_rule_config(classname, &schema, raw_config)?,
            None => match raw_config {
                serde_json::Value::Null => serde_json::Value::Null,
                serde_json::Value::Object(map) if map.is_empty() => serde_json::Value::Null,
                _ => {
                    return Err(WatcherError::Schema {
                        target: classname.to_string(),
                        violations: vec!["this rule takes no configuration".to_string()],
                    })
                }
            },
        };
        let rule = (class.build)(config)?;
        debug!("Created rule {} from class {}", rule.name(), classname);
        Ok(rule)
    }
}

/// Deserialize a validated, defaulted config into a rule's typed config
pub fn parse_config<T: DeserializeOwned>(classname: &str, config: serde_json::Value) -> Result<T> {
    serde_json::from_value(config).map_err(|e| WatcherError::Schema {
        target: classname.to_string(),
        violations: vec![e.to_string()],
    })
}
