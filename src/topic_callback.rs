// src/topic_callback.rs - Fan-out from one callback topic to its rules
use crate::{
    bus::{Bus, TopicHandle},
    error::{Result, WatcherError},
    filtered_topic_wrapper::FilteredTopicWrapper,
    rule::{SeverityUpdate, SharedRule},
    value::{Sample, TopicKey},
};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use parking_lot::RwLock;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, trace, warn};

/// What one delivery did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    /// Rules whose evaluation was attempted
    pub invoked: usize,
    /// Alarms that accepted a new severity
    pub changed: usize,
    /// Rules that returned an error or panicked
    pub failed: usize,
    /// True if the model was disabled and no rule ran
    pub suppressed: bool,
}

/// One per subscribed callback topic.
///
/// Filtered topic wrappers are refreshed on every delivery, even while
/// the model is disabled. Rules run in name order, and only while enabled.
/// A failing rule is logged and skipped; its siblings still run on the same delivery.
pub struct TopicCallback {
    handle: TopicHandle,
    attr_name: String,
    bus: Arc<dyn Bus>,
    enabled: Arc<AtomicBool>,
    rules: BTreeMap<String, SharedRule>,
    topic_wrappers: Vec<Arc<FilteredTopicWrapper>>,
    latest: RwLock<Option<Sample>>,
}

impl TopicCallback {
    pub fn new(handle: TopicHandle, bus: Arc<dyn Bus>, enabled: Arc<AtomicBool>) -> Self {
        let key = handle.key();
        let attr_name = format!("{}_{}", key.source.to_lowercase(), key.index);
        Self {
            handle,
            attr_name,
            bus,
            enabled,
            rules: BTreeMap::new(),
            topic_wrappers: Vec::new(),
            latest: RwLock::new(None),
        }
    }

    pub fn topic_key(&self) -> &TopicKey {
        self.handle.key()
    }

    pub fn handle(&self) -> &TopicHandle {
        &self.handle
    }

    /// Attribute name of the remote wrapper the topic belongs to
    pub fn attr_name(&self) -> &str {
        &self.attr_name
    }

    /// Register a rule; fails if one with the same name is present
    pub fn add_rule(&mut self, rule: SharedRule) -> Result<()> {
        let name = rule.lock().name().to_string();
        if self.rules.contains_key(&name) {
            return Err(WatcherError::DuplicateRule(format!(
                "{} is already registered on {}",
                name,
                self.topic_key()
            )));
        }
        self.rules.insert(name, rule);
        Ok(())
    }

    pub fn add_topic_wrapper(&mut self, wrapper: Arc<FilteredTopicWrapper>) {
        if !self.topic_wrappers.iter().any(|w| Arc::ptr_eq(w, &wrapper)) {
            self.topic_wrappers.push(wrapper);
        }
    }

    pub fn rule_names(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }

    pub fn has_rules(&self) -> bool {
        !self.rules.is_empty()
    }

    /// Most recent sample on this topic.
    ///
    /// The last sample passed to [`TopicCallback::call`] wins; before the
    /// first delivery this falls back to the bus cache.
    pub fn get(&self) -> Option<Sample> {
        if let Some(sample) = self.latest.read().as_ref() {
            return Some(sample.clone());
        }
        self.bus.get_current(&self.handle)
    }

    /// Handle one delivery
    pub fn call(&self, data: &Sample) -> DispatchReport {
        let mut report = DispatchReport::default();
        *self.latest.write() = Some(data.clone());

        for wrapper in &self.topic_wrappers {
            if let Err(e) = wrapper.update(data) {
                warn!("Filtered wrapper on {} rejected sample {}: {}", self.topic_key(), data, e);
            }
        }

        if !self.enabled.load(Ordering::SeqCst) {
            trace!("Model disabled; not evaluating rules for {}", self.topic_key());
            report.suppressed = true;
            return report;
        }

        for (name, rule) in &self.rules {
            report.invoked += 1;
            let mut rule = rule.lock();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                rule.compute_alarm_severity(data, self)
            }));
            match outcome {
                Ok(Ok(SeverityUpdate::Changed(severity, reason))) => {
                    if rule.alarm().set_severity(severity, reason) {
                        report.changed += 1;
                    }
                }
                Ok(Ok(SeverityUpdate::Unchanged)) => {}
                Ok(Err(e)) => {
                    report.failed += 1;
                    error!(
                        "Rule {} failed on {} with sample {}: {}",
                        name,
                        self.topic_key(),
                        data,
                        e
                    );
                }
                Err(payload) => {
                    report.failed += 1;
                    error!(
                        "Rule {} panicked on {} with sample {}: {}",
                        name,
                        self.topic_key(),
                        data,
                        panic_message(payload.as_ref())
                    );
                }
            }
        }
        report
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl fmt::Debug for TopicCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicCallback")
            .field("topic", self.topic_key())
            .field("rules", &self.rules.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::Severity;
    use crate::bus::LocalBus;
    use crate::remote_info::RemoteInfo;
    use crate::rule::{Rule, RuleBase};
    use crate::value::TopicSchema;
    use parking_lot::Mutex;

    enum Behavior {
        Report(Severity),
        Fail,
        Panic,
    }

    struct ScriptedRule {
        base: RuleBase,
        behavior: Behavior,
    }

    impl Rule for ScriptedRule {
        fn base(&self) -> &RuleBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut RuleBase {
            &mut self.base
        }

        fn compute_alarm_severity(
            &mut self,
            _data: &Sample,
            topic_callback: &TopicCallback,
        ) -> Result<SeverityUpdate> {
            assert_eq!(topic_callback.attr_name(), "test_0");
            match self.behavior {
                Behavior::Report(severity) => Ok(SeverityUpdate::changed(severity, "scripted")),
                Behavior::Fail => Err(self.base.error("intentional failure")),
                Behavior::Panic => panic!("intentional panic"),
            }
        }
    }

    fn scripted(name: &str, behavior: Behavior) -> SharedRule {
        let info = RemoteInfo::new("Test", 0, ["evt_scalars"], Vec::<&str>::new()).unwrap();
        let rule: Box<dyn Rule> = Box::new(ScriptedRule {
            base: RuleBase::new(name, vec![info]),
            behavior,
        });
        Arc::new(Mutex::new(rule))
    }

    fn callback(enabled: bool) -> TopicCallback {
        let bus = LocalBus::new();
        bus.declare_topic("Test", "evt_scalars", TopicSchema::new());
        let handle = bus.subscribe(&TopicKey::new("Test", 0, "evt_scalars")).unwrap();
        TopicCallback::new(handle, Arc::new(bus), Arc::new(AtomicBool::new(enabled)))
    }

    #[test]
    fn test_duplicate_rule_name() {
        let mut tc = callback(true);
        tc.add_rule(scripted("a", Behavior::Report(Severity::Warning))).unwrap();
        assert!(matches!(
            tc.add_rule(scripted("a", Behavior::Fail)),
            Err(WatcherError::DuplicateRule(_))
        ));
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let mut tc = callback(true);
        let good_a = scripted("a_good", Behavior::Report(Severity::Warning));
        let bad = scripted("b_bad", Behavior::Fail);
        let panicky = scripted("c_panicky", Behavior::Panic);
        let good_d = scripted("d_good", Behavior::Report(Severity::Critical));
        for rule in [&good_a, &bad, &panicky, &good_d] {
            tc.add_rule(rule.clone()).unwrap();
        }

        let report = tc.call(&Sample::new());
        assert_eq!(report.invoked, 4);
        assert_eq!(report.failed, 2);
        assert_eq!(report.changed, 2);
        assert_eq!(good_a.lock().alarm().severity(), Severity::Warning);
        assert_eq!(good_d.lock().alarm().severity(), Severity::Critical);
        assert!(bad.lock().alarm().nominal());
        assert!(panicky.lock().alarm().nominal());

        // A panicking rule stays usable for the next delivery
        let report = tc.call(&Sample::new());
        assert_eq!(report.invoked, 4);
        assert_eq!(report.changed, 0);
    }

    #[tokio::test]
    async fn test_disabled_suppresses_rules() {
        let mut tc = callback(false);
        let rule = scripted("a", Behavior::Report(Severity::Serious));
        tc.add_rule(rule.clone()).unwrap();
        let report = tc.call(&Sample::new());
        assert!(report.suppressed);
        assert_eq!(report.invoked, 0);
        assert!(rule.lock().alarm().nominal());
    }

    #[test]
    fn test_get_reads_latest_sample() {
        let bus = LocalBus::new();
        bus.declare_topic("Test", "evt_scalars", TopicSchema::new());
        let key = TopicKey::new("Test", 0, "evt_scalars");
        let handle = bus.subscribe(&key).unwrap();
        let tc = TopicCallback::new(handle, Arc::new(bus.clone()), Arc::new(AtomicBool::new(true)));
        assert!(tc.get().is_none());
        bus.publish(&key, Sample::new().with("int0", 3i64)).unwrap();
        assert_eq!(tc.get().unwrap().get_int("int0"), Some(3));
        assert_eq!(bus.subscription_count(&key), 1);
    }

    #[tokio::test]
    async fn test_get_sees_directly_dispatched_sample() {
        let mut tc = callback(true);
        let rule = scripted("a", Behavior::Report(Severity::Warning));
        tc.add_rule(rule).unwrap();
        assert!(tc.get().is_none());

        tc.call(&Sample::new().with("int0", 7i64));
        assert_eq!(tc.get().unwrap().get_int("int0"), Some(7));

        // Also while disabled: the cache tracks deliveries, not evaluation
        let tc = callback(false);
        tc.call(&Sample::new().with("int0", 8i64));
        assert_eq!(tc.get().unwrap().get_int("int0"), Some(8));
    }
}
