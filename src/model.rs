// src/model.rs - Rule wiring, enable gating and sample dispatch
//
// Startup builds every rule, then wires it in three passes: remote wrappers
// (one per source, subscribed to the union of requested topics), topic
// callbacks (one per callback topic), and rule-specific setup such as
// filtered topic wrappers. Any failure aborts the whole build; nothing is
// started until `enable`.
//
// After wiring, the registries are only read. Bus callbacks enqueue
// deliveries on a channel and the model drains it one sample at a time, so
// each delivery is fully evaluated before the next begins. Operator control
// (enable, disable, acknowledge, mute) goes through a cloneable ModelHandle
// and may run concurrently with the dispatch loop.

use crate::{
    alarm::{validate_mute, Alarm, AlarmSnapshot, EscalationSettings, Severity},
    bus::Bus,
    config::{glob_to_regex, EscalationConfig, WatcherConfig},
    error::{Result, WatcherError},
    escalation::{Escalator, IncidentRegistry, Pager},
    filtered_topic_wrapper::FilteredTopicWrapper,
    remote_info::SourceKey,
    remote_wrapper::RemoteWrapper,
    rule::{Rule, RuleRegistry, SharedRule},
    topic_callback::{DispatchReport, TopicCallback},
    value::{Sample, TopicKey},
};
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// One sample queued by a bus callback
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: TopicKey,
    pub sample: Sample,
}

/// Counters and sizes for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct ModelStats {
    pub enabled: bool,
    pub rule_count: usize,
    pub remote_count: usize,
    pub topic_count: usize,
    pub deliveries: u64,
    pub rule_failures: u64,
}

// ============================================================================
// ESCALATION POLICIES
// ============================================================================

struct EscalationPolicy {
    patterns: Vec<Regex>,
    settings: EscalationSettings,
}

impl EscalationPolicy {
    fn compile(config: &EscalationConfig) -> Result<Self> {
        let patterns = config
            .patterns()
            .map(glob_to_regex)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            patterns,
            settings: EscalationSettings {
                responder: config.responder.clone(),
                delay: config.delay()?,
                threshold: config.severity,
                resolve_on: config.resolve_on,
            },
        })
    }

    fn matches(&self, alarm_name: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(alarm_name))
    }
}

// ============================================================================
// WIRING
// ============================================================================

type FilteredWrappers = HashMap<(TopicKey, String), Arc<FilteredTopicWrapper>>;

/// Registries a rule may extend from `Rule::setup`
pub struct Wiring<'a> {
    rule_name: &'a str,
    topic_callbacks: &'a mut BTreeMap<TopicKey, TopicCallback>,
    filtered_wrappers: &'a mut FilteredWrappers,
}

impl Wiring<'_> {
    /// Name of the rule being set up
    pub fn rule_name(&self) -> &str {
        self.rule_name
    }

    /// Shared filtered wrapper for `topic`, keyed on `filter_field`.
    ///
    /// `topic` must be a callback topic of some rule, since the wrapper is
    /// fed from its TopicCallback. The first caller's `default` wins.
    pub fn filtered_topic_wrapper(
        &mut self,
        topic: &TopicKey,
        filter_field: &str,
        default: Option<Sample>,
    ) -> Result<Arc<FilteredTopicWrapper>> {
        filtered_wrapper(
            self.topic_callbacks,
            self.filtered_wrappers,
            topic,
            filter_field,
            default,
        )
    }
}

fn filtered_wrapper(
    topic_callbacks: &mut BTreeMap<TopicKey, TopicCallback>,
    wrappers: &mut FilteredWrappers,
    topic: &TopicKey,
    filter_field: &str,
    default: Option<Sample>,
) -> Result<Arc<FilteredTopicWrapper>> {
    let key = (topic.clone(), filter_field.to_string());
    if let Some(existing) = wrappers.get(&key) {
        return Ok(existing.clone());
    }
    let topic_callback = topic_callbacks.get_mut(topic).ok_or_else(|| {
        WatcherError::UnknownTopic(format!(
            "{} is not a callback topic; a filtered wrapper needs one",
            topic
        ))
    })?;
    let wrapper = Arc::new(FilteredTopicWrapper::new(
        topic_callback.handle(),
        filter_field,
        default,
    )?);
    topic_callback.add_topic_wrapper(wrapper.clone());
    debug!("Created filtered wrapper on {} keyed by {}", topic, filter_field);
    wrappers.insert(key, wrapper.clone());
    Ok(wrapper)
}

// ============================================================================
// CONTROL HANDLE
// ============================================================================

/// Cloneable control surface of a [`Model`].
///
/// Every method takes `&self` and is safe to call from other tasks while
/// [`Model::run`] owns the model. Rules are locked one at a time, so a call
/// may interleave with a delivery but never with one rule's evaluation.
#[derive(Clone)]
pub struct ModelHandle {
    control: Arc<Control>,
}

struct Control {
    rules: BTreeMap<String, SharedRule>,
    alarms: BTreeMap<String, Alarm>,
    enabled: Arc<AtomicBool>,
    closed: AtomicBool,
    snapshots: mpsc::UnboundedSender<AlarmSnapshot>,
    // Serializes enable, disable and close
    transition: Mutex<()>,
}

impl ModelHandle {
    /// Reset every alarm to nominal, start every rule and start evaluating.
    ///
    /// Missed samples are not replayed. Open incidents see the reset and
    /// resolve. No-op if already enabled or closed.
    pub fn enable(&self) {
        let c = &self.control;
        let _transition = c.transition.lock();
        if c.closed.load(Ordering::SeqCst) {
            warn!("Cannot enable a closed model");
            return;
        }
        if c.enabled.load(Ordering::SeqCst) {
            return;
        }
        for (name, rule) in &c.rules {
            let mut rule = rule.lock();
            if let Some(alarm) = c.alarms.get(name) {
                let snapshot = alarm.reset();
                if c.snapshots.send(snapshot).is_err() {
                    trace!("Escalation worker gone; dropping reset of {}", name);
                }
            }
            rule.start();
        }
        c.enabled.store(true, Ordering::SeqCst);
        info!("Model enabled with {} rules", c.rules.len());
    }

    /// Stop evaluating rules, stop their background work and suspend every
    /// alarm. Samples keep arriving and caches stay warm. Alarm state is
    /// frozen until the next `enable` resets it.
    pub fn disable(&self) {
        let c = &self.control;
        let _transition = c.transition.lock();
        if !c.enabled.swap(false, Ordering::SeqCst) {
            return;
        }
        self.halt();
        info!("Model disabled");
    }

    fn halt(&self) {
        let c = &self.control;
        for (name, rule) in &c.rules {
            let mut rule = rule.lock();
            rule.stop();
            if let Some(alarm) = c.alarms.get(name) {
                alarm.suspend();
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.control.enabled.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.control.closed.load(Ordering::SeqCst)
    }

    /// Names of rules whose name matches `pattern` from its first character
    pub fn get_rules(&self, pattern: &str) -> Result<Vec<String>> {
        let re = Regex::new(&format!("^(?:{})", pattern)).map_err(|e| WatcherError::InvalidPattern {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })?;
        Ok(self
            .control
            .rules
            .keys()
            .filter(|name| re.is_match(name))
            .cloned()
            .collect())
    }

    /// Apply `op` to every alarm matching `pattern`; returns those that changed
    fn each_alarm<F>(&self, pattern: &str, mut op: F) -> Result<Vec<String>>
    where
        F: FnMut(&Alarm) -> bool,
    {
        let names = self.get_rules(pattern)?;
        Ok(names
            .into_iter()
            .filter(|name| self.control.alarms.get(name).is_some_and(&mut op))
            .collect())
    }

    /// Acknowledge matching alarms; returns those that changed
    pub fn acknowledge_alarms(&self, pattern: &str, by: &str) -> Result<Vec<String>> {
        self.each_alarm(pattern, |alarm| alarm.acknowledge(by))
    }

    /// Unacknowledge matching alarms; returns those that changed
    pub fn unacknowledge_alarms(&self, pattern: &str) -> Result<Vec<String>> {
        self.each_alarm(pattern, |alarm| alarm.unacknowledge())
    }

    /// Mute matching alarms for `duration` at `severity`; returns those muted.
    ///
    /// Fails on a zero duration or a NONE severity even if nothing matches.
    pub fn mute_alarms(&self, pattern: &str, duration: Duration, severity: Severity, by: &str) -> Result<Vec<String>> {
        validate_mute(pattern, duration, severity)?;
        let mut first_error = None;
        let muted = self.each_alarm(pattern, |alarm| match alarm.mute(duration, severity, by) {
            Ok(changed) => changed,
            Err(e) => {
                first_error.get_or_insert(e);
                false
            }
        })?;
        match first_error {
            Some(e) => Err(e),
            None => Ok(muted),
        }
    }

    /// Unmute matching alarms; returns those that were muted
    pub fn unmute_alarms(&self, pattern: &str) -> Result<Vec<String>> {
        self.each_alarm(pattern, |alarm| alarm.unmute())
    }

    pub fn alarm(&self, name: &str) -> Option<Alarm> {
        self.control.alarms.get(name).cloned()
    }

    pub fn rule_names(&self) -> Vec<String> {
        self.control.rules.keys().cloned().collect()
    }

    /// Disable, stop every rule and close every alarm. Returns false if the
    /// model was already closed.
    fn close(&self) -> bool {
        let c = &self.control;
        let _transition = c.transition.lock();
        if c.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        c.enabled.store(false, Ordering::SeqCst);
        self.halt();
        for alarm in c.alarms.values() {
            alarm.close();
        }
        true
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("rules", &self.control.rules.len())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

// ============================================================================
// MODEL
// ============================================================================

/// Every active rule, wired to the bus.
///
/// Created disabled: samples are cached but no rule runs and every alarm is
/// suspended until [`Model::enable`]. Must be created inside a Tokio
/// runtime, which runs the alarm timers, rule tasks and the escalation
/// worker.
pub struct Model {
    handle: ModelHandle,
    disabled_sources: HashSet<SourceKey>,
    remotes: BTreeMap<SourceKey, Arc<RemoteWrapper>>,
    topic_callbacks: BTreeMap<TopicKey, TopicCallback>,
    filtered_wrappers: FilteredWrappers,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
    incidents: IncidentRegistry,
    escalation_worker: Option<JoinHandle<()>>,
    delivery_count: u64,
    failure_count: u64,
}

impl Model {
    /// Build and wire every configured rule.
    ///
    /// Fails without starting anything on an unknown rule class, a config
    /// that violates its schema, a duplicate rule name or a topic the bus
    /// does not know.
    pub fn new(
        config: &WatcherConfig,
        bus: Arc<dyn Bus>,
        registry: &RuleRegistry,
        pager: Arc<dyn Pager>,
    ) -> Result<Self> {
        tokio::runtime::Handle::try_current().map_err(|e| {
            WatcherError::Config(format!("the model must be created inside a Tokio runtime: {}", e))
        })?;
        config.validate()?;
        let disabled_sources = config.disabled_source_keys()?;
        let auto_acknowledge = config.auto_acknowledge()?;
        let auto_unacknowledge = config.auto_unacknowledge()?;
        let escalation_timeout = config.escalation_timeout()?;
        let policies = config
            .escalation
            .iter()
            .map(EscalationPolicy::compile)
            .collect::<Result<Vec<_>>>()?;

        // Instantiate rules
        let mut built: BTreeMap<String, Box<dyn Rule>> = BTreeMap::new();
        for entry in &config.rules {
            for raw in &entry.configs {
                let rule = registry.create(&entry.classname, raw)?;
                if !rule.is_usable(&disabled_sources) {
                    info!("Skipping rule {}: it reads a disabled source", rule.name());
                    continue;
                }
                if built.contains_key(rule.name()) {
                    return Err(WatcherError::DuplicateRule(format!(
                        "{} is configured more than once",
                        rule.name()
                    )));
                }
                built.insert(rule.name().to_string(), rule);
            }
        }

        // Remote wrappers
        let mut wrappers: BTreeMap<SourceKey, RemoteWrapper> = BTreeMap::new();
        for rule in built.values() {
            for info in rule.remote_info_list() {
                wrappers
                    .entry(info.key().clone())
                    .or_insert_with(|| RemoteWrapper::new(info.key().clone(), bus.clone()))
                    .add_topics(info.topic_names())?;
            }
        }
        let remotes: BTreeMap<SourceKey, Arc<RemoteWrapper>> = wrappers
            .into_iter()
            .map(|(key, wrapper)| (key, Arc::new(wrapper)))
            .collect();

        // Alarms and topic callbacks
        let enabled = Arc::new(AtomicBool::new(false));
        let (snapshot_tx, snapshot_rx) = mpsc::unbounded_channel::<AlarmSnapshot>();
        let mut rules = BTreeMap::new();
        let mut alarms = BTreeMap::new();
        let mut topic_callbacks: BTreeMap<TopicKey, TopicCallback> = BTreeMap::new();
        for (name, mut rule) in built {
            let infos = rule.remote_info_list().to_vec();
            for info in &infos {
                let remote = lookup_remote(&remotes, info.key())?;
                rule.base_mut().attach_remote(remote.clone());
            }

            let alarm = rule.alarm().clone();
            alarm.configure_basics(auto_acknowledge, auto_unacknowledge);
            let escalation = policies
                .iter()
                .find(|policy| policy.matches(&name))
                .map(|policy| policy.settings.clone());
            if let Some(settings) = &escalation {
                debug!("Alarm {} escalates to {}", name, settings.responder);
            }
            alarm.configure_escalation(escalation);
            let tx = snapshot_tx.clone();
            alarm.set_observer(Arc::new(move |snapshot: &AlarmSnapshot| {
                if tx.send(snapshot.clone()).is_err() {
                    trace!("Escalation worker gone; dropping snapshot of {}", snapshot.name);
                }
            }));
            alarm.suspend();

            let shared: SharedRule = Arc::new(Mutex::new(rule));
            for info in &infos {
                let remote = lookup_remote(&remotes, info.key())?;
                for topic_name in info.callback_names() {
                    let handle = remote.handle(topic_name).ok_or_else(|| {
                        WatcherError::UnknownTopic(format!("{} is not subscribed by {}", topic_name, info.key()))
                    })?;
                    topic_callbacks
                        .entry(handle.key().clone())
                        .or_insert_with(|| TopicCallback::new(handle.clone(), bus.clone(), enabled.clone()))
                        .add_rule(shared.clone())?;
                }
            }
            alarms.insert(name.clone(), alarm);
            rules.insert(name, shared);
        }

        // Rule-specific wiring
        let mut filtered_wrappers = FilteredWrappers::new();
        for (name, rule) in &rules {
            let mut wiring = Wiring {
                rule_name: name,
                topic_callbacks: &mut topic_callbacks,
                filtered_wrappers: &mut filtered_wrappers,
            };
            rule.lock().setup(&mut wiring)?;
        }

        // Route deliveries
        let (delivery_tx, deliveries) = mpsc::unbounded_channel();
        for (key, topic_callback) in &topic_callbacks {
            let tx = delivery_tx.clone();
            let topic = key.clone();
            bus.set_callback(
                topic_callback.handle(),
                Arc::new(move |sample: &Sample| {
                    let delivery = Delivery {
                        topic: topic.clone(),
                        sample: sample.clone(),
                    };
                    if tx.send(delivery).is_err() {
                        trace!("Model gone; dropping sample on {}", topic);
                    }
                }),
            )?;
        }

        let escalator = Escalator::new(pager, config.escalation_retry.clone(), escalation_timeout);
        let incidents = escalator.incidents();
        let escalation_worker = escalator.spawn(snapshot_rx);

        info!(
            "Model wired: {} rules, {} sources, {} callback topics, {} filtered wrappers",
            rules.len(),
            remotes.len(),
            topic_callbacks.len(),
            filtered_wrappers.len()
        );

        let handle = ModelHandle {
            control: Arc::new(Control {
                rules,
                alarms,
                enabled,
                closed: AtomicBool::new(false),
                snapshots: snapshot_tx,
                transition: Mutex::new(()),
            }),
        };

        Ok(Self {
            handle,
            disabled_sources,
            remotes,
            topic_callbacks,
            filtered_wrappers,
            deliveries,
            incidents,
            escalation_worker: Some(escalation_worker),
            delivery_count: 0,
            failure_count: 0,
        })
    }

    // ========================================================================
    // ENABLE / DISABLE
    // ========================================================================

    /// Control surface usable while [`Model::run`] holds the model
    pub fn handle(&self) -> ModelHandle {
        self.handle.clone()
    }

    /// See [`ModelHandle::enable`]
    pub fn enable(&self) {
        self.handle.enable();
    }

    /// See [`ModelHandle::disable`]
    pub fn disable(&self) {
        self.handle.disable();
    }

    pub fn is_enabled(&self) -> bool {
        self.handle.is_enabled()
    }

    // ========================================================================
    // DISPATCH
    // ========================================================================

    /// Deliver one sample to the topic's callback.
    ///
    /// Returns `None` if no rule listens on `topic`.
    pub fn dispatch(&mut self, topic: &TopicKey, sample: &Sample) -> Option<DispatchReport> {
        let Some(topic_callback) = self.topic_callbacks.get(topic) else {
            debug!("No callback for {}; sample dropped", topic);
            return None;
        };
        let report = topic_callback.call(sample);
        self.delivery_count += 1;
        self.failure_count += report.failed as u64;
        Some(report)
    }

    /// Dispatch everything already queued by the bus; returns the count
    pub fn process_pending(&mut self) -> usize {
        let mut count = 0;
        while let Ok(delivery) = self.deliveries.try_recv() {
            self.dispatch(&delivery.topic, &delivery.sample);
            count += 1;
        }
        count
    }

    /// Dispatch queued deliveries one at a time until `shutdown` completes.
    ///
    /// Use [`Model::handle`] beforehand to keep control of the model while
    /// this runs.
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        enum Step {
            Stop,
            Deliver(Delivery),
            Drained,
        }

        tokio::pin!(shutdown);
        info!("Dispatch loop started");
        loop {
            let step = tokio::select! {
                biased;
                _ = &mut shutdown => Step::Stop,
                delivery = self.deliveries.recv() => match delivery {
                    Some(delivery) => Step::Deliver(delivery),
                    None => Step::Drained,
                },
            };
            match step {
                Step::Stop => break,
                Step::Deliver(delivery) => {
                    self.dispatch(&delivery.topic, &delivery.sample);
                }
                Step::Drained => {
                    debug!("Bus released every callback; waiting for shutdown");
                    shutdown.as_mut().await;
                    break;
                }
            }
        }
        info!("Dispatch loop stopped after {} deliveries", self.delivery_count);
    }

    // ========================================================================
    // ALARM OPERATIONS
    // ========================================================================
    pub fn get_rules(&self, pattern: &str) -> Result<Vec<String>> {
        self.handle.get_rules(pattern)
    }

    pub fn acknowledge_alarms(&self, pattern: &str, by: &str) -> Result<Vec<String>> {
        self.handle.acknowledge_alarms(pattern, by)
    }

    pub fn unacknowledge_alarms(&self, pattern: &str) -> Result<Vec<String>> {
        self.handle.unacknowledge_alarms(pattern)
    }

    pub fn mute_alarms(&self, pattern: &str, duration: Duration, severity: Severity, by: &str) -> Result<Vec<String>> {
        self.handle.mute_alarms(pattern, duration, severity, by)
    }

    pub fn unmute_alarms(&self, pattern: &str) -> Result<Vec<String>> {
        self.handle.unmute_alarms(pattern)
    }

    // ========================================================================
    // LOOKUPS
    // ========================================================================

    pub fn rule(&self, name: &str) -> Option<&SharedRule> {
        self.handle.control.rules.get(name)
    }

    pub fn rule_names(&self) -> impl Iterator<Item = &str> {
        self.handle.control.rules.keys().map(String::as_str)
    }

    pub fn alarm(&self, name: &str) -> Option<&Alarm> {
        self.handle.control.alarms.get(name)
    }

    pub fn alarms(&self) -> impl Iterator<Item = &Alarm> {
        self.handle.control.alarms.values()
    }

    pub fn remote(&self, key: &SourceKey) -> Option<&Arc<RemoteWrapper>> {
        self.remotes.get(key)
    }

    pub fn topic_callback(&self, topic: &TopicKey) -> Option<&TopicCallback> {
        self.topic_callbacks.get(topic)
    }

    pub fn topic_keys(&self) -> impl Iterator<Item = &TopicKey> {
        self.topic_callbacks.keys()
    }

    pub fn disabled_sources(&self) -> &HashSet<SourceKey> {
        &self.disabled_sources
    }

    /// Shared filtered wrapper on a callback topic; see [`Wiring::filtered_topic_wrapper`]
    pub fn make_filtered_topic_wrapper(
        &mut self,
        topic: &TopicKey,
        filter_field: &str,
    ) -> Result<Arc<FilteredTopicWrapper>> {
        filtered_wrapper(
            &mut self.topic_callbacks,
            &mut self.filtered_wrappers,
            topic,
            filter_field,
            None,
        )
    }

    /// Id of the open incident for an alarm, if any
    pub fn incident_id(&self, alarm_name: &str) -> Option<String> {
        self.incidents.incident_id(alarm_name)
    }

    pub fn incidents(&self) -> &IncidentRegistry {
        &self.incidents
    }

    pub fn stats(&self) -> ModelStats {
        ModelStats {
            enabled: self.is_enabled(),
            rule_count: self.handle.control.rules.len(),
            remote_count: self.remotes.len(),
            topic_count: self.topic_callbacks.len(),
            deliveries: self.delivery_count,
            rule_failures: self.failure_count,
        }
    }

    // ========================================================================
    // SHUTDOWN
    // ========================================================================

    /// Disable, stop every rule, close every alarm and stop the escalation
    /// worker. Safe to call more than once. Handles see a closed model.
    pub fn close(&mut self) {
        let first = self.handle.close();
        if let Some(worker) = self.escalation_worker.take() {
            worker.abort();
        }
        if first {
            info!("Model closed");
        }
    }
}

impl Drop for Model {
    fn drop(&mut self) {
        self.close();
    }
}

fn lookup_remote<'a>(
    remotes: &'a BTreeMap<SourceKey, Arc<RemoteWrapper>>,
    key: &SourceKey,
) -> Result<&'a Arc<RemoteWrapper>> {
    remotes
        .get(key)
        .ok_or_else(|| WatcherError::InvalidRemoteInfo(format!("no remote wrapper for {}", key)))
}
