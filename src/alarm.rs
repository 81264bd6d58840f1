// src/alarm.rs - Severity, acknowledgment and escalation state machine
//
// One Alarm belongs to one rule. All mutation goes through set_severity,
// acknowledge, unacknowledge, mute, reset and the timers (auto-acknowledge,
// auto-unacknowledge, escalation, unmute). Timers are tokio tasks held in
// TaskSlots, so re-arming a timer always cancels the pending one of the same
// kind. A suspended alarm ignores severities and arms no severity timers
// until it is reset.

use crate::error::{Result, WatcherError};
use crate::task::TaskSlot;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Default delay for both acknowledgment timers
pub const DEFAULT_AUTO_DELAY: Duration = Duration::from_secs(3600);

/// `acknowledged_by` value used by the auto-acknowledge timer
pub const AUTOMATIC_USER: &str = "automatic";

// ============================================================================
// SEVERITY
// ============================================================================

/// Alarm severity, strictly ordered NONE < WARNING < SERIOUS < CRITICAL.
///
/// Deserializes from a name (`"warning"`, case-insensitive) or from the
/// integer codes 1 through 4; serializes as the upper-case name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "SeverityRepr", into = "String")]
pub enum Severity {
    None = 1,
    Warning = 2,
    Serious = 3,
    Critical = 4,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SeverityRepr {
    Code(i64),
    Name(String),
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::None,
        Severity::Warning,
        Severity::Serious,
        Severity::Critical,
    ];

    pub fn from_code(code: i64) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|s| *s as i64 == code)
            .ok_or_else(|| WatcherError::InvalidSeverity(code.to_string()))
    }

    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn name(self) -> &'static str {
        match self {
            Severity::None => "NONE",
            Severity::Warning => "WARNING",
            Severity::Serious => "SERIOUS",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl FromStr for Severity {
    type Err = WatcherError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|sev| sev.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| WatcherError::InvalidSeverity(s.to_string()))
    }
}

impl TryFrom<SeverityRepr> for Severity {
    type Error = WatcherError;

    fn try_from(repr: SeverityRepr) -> Result<Self> {
        match repr {
            SeverityRepr::Code(code) => Severity::from_code(code),
            SeverityRepr::Name(name) => name.parse(),
        }
    }
}

impl From<Severity> for String {
    fn from(s: Severity) -> Self {
        s.name().to_string()
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// ESCALATION SETTINGS
// ============================================================================

/// When an open incident is resolved
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolvePolicy {
    /// Resolve once severity returns to NONE
    #[default]
    Nominal,
    /// Resolve on acknowledgment as well
    Acknowledged,
}

/// Per-alarm escalation parameters, assigned by the model from the first
/// matching escalation policy
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EscalationSettings {
    pub responder: String,
    pub delay: Duration,
    pub threshold: Severity,
    pub resolve_on: ResolvePolicy,
}

impl EscalationSettings {
    fn is_enabled(&self) -> bool {
        !self.responder.is_empty() && !self.delay.is_zero()
    }
}

// ============================================================================
// SNAPSHOT
// ============================================================================

/// Immutable copy of alarm state handed to observers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlarmSnapshot {
    pub name: String,
    pub severity: Severity,
    pub max_severity: Severity,
    pub reason: String,
    pub acknowledged: bool,
    pub acknowledged_by: String,
    pub timestamp_severity_oldest: Option<DateTime<Utc>>,
    pub timestamp_severity_newest: Option<DateTime<Utc>>,
    pub timestamp_acknowledged: Option<DateTime<Utc>>,
    pub escalated: bool,
    pub escalation: Option<EscalationSettings>,
    /// NONE when not muted
    pub muted_severity: Severity,
    pub muted_by: String,
    pub timestamp_unmute: Option<DateTime<Utc>>,
}

impl AlarmSnapshot {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            severity: Severity::None,
            max_severity: Severity::None,
            reason: String::new(),
            acknowledged: false,
            acknowledged_by: String::new(),
            timestamp_severity_oldest: None,
            timestamp_severity_newest: None,
            timestamp_acknowledged: None,
            escalated: false,
            escalation: None,
            muted_severity: Severity::None,
            muted_by: String::new(),
            timestamp_unmute: None,
        }
    }

    pub fn nominal(&self) -> bool {
        self.severity == Severity::None
    }

    pub fn muted(&self) -> bool {
        self.muted_severity != Severity::None
    }
}

/// Callback invoked once per accepted transition, outside the alarm lock.
/// It must not mutate the alarm it observes.
pub type AlarmObserver = Arc<dyn Fn(&AlarmSnapshot) + Send + Sync>;

/// Which timers are currently pending
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTimers {
    pub auto_acknowledge: bool,
    pub auto_unacknowledge: bool,
    pub escalation: bool,
    pub unmute: bool,
}

/// Check mute arguments: the duration must be positive and the severity
/// above NONE. `target` names what was being muted in the error.
pub fn validate_mute(target: &str, duration: Duration, severity: Severity) -> Result<()> {
    if duration.is_zero() {
        return Err(WatcherError::Config(format!(
            "{}: mute duration must be positive",
            target
        )));
    }
    if severity == Severity::None {
        return Err(WatcherError::InvalidSeverity(format!(
            "{}: cannot mute at severity NONE",
            target
        )));
    }
    Ok(())
}

// ============================================================================
// ALARM
// ============================================================================

/// Cloneable handle to one alarm. Clones share state.
#[derive(Clone)]
pub struct Alarm {
    inner: Arc<AlarmInner>,
}

struct AlarmInner {
    name: String,
    core: Mutex<AlarmCore>,
    observer: RwLock<Option<AlarmObserver>>,
    // Taken before the core lock is released so notifications keep
    // transition order across threads.
    notify_order: Mutex<()>,
}

struct AlarmCore {
    state: AlarmSnapshot,
    auto_acknowledge_delay: Duration,
    auto_unacknowledge_delay: Duration,
    auto_acknowledge_timer: TaskSlot,
    auto_unacknowledge_timer: TaskSlot,
    escalation_timer: TaskSlot,
    unmute_delay: Duration,
    unmute_timer: TaskSlot,
    severity_queue: Option<mpsc::Sender<Severity>>,
    suspended: bool,
    closed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fired {
    AutoAcknowledge,
    AutoUnacknowledge,
    Escalation,
    Unmute,
}

impl fmt::Debug for Alarm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Alarm")
            .field("state", &self.snapshot())
            .finish()
    }
}

impl Alarm {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let core = AlarmCore {
            state: AlarmSnapshot::new(&name),
            auto_acknowledge_delay: DEFAULT_AUTO_DELAY,
            auto_unacknowledge_delay: DEFAULT_AUTO_DELAY,
            auto_acknowledge_timer: TaskSlot::new("auto-acknowledge timer"),
            auto_unacknowledge_timer: TaskSlot::new("auto-unacknowledge timer"),
            escalation_timer: TaskSlot::new("escalation timer"),
            unmute_delay: Duration::ZERO,
            unmute_timer: TaskSlot::new("unmute timer"),
            severity_queue: None,
            suspended: false,
            closed: false,
        };
        Self {
            inner: Arc::new(AlarmInner {
                name,
                core: Mutex::new(core),
                observer: RwLock::new(None),
                notify_order: Mutex::new(()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Set the acknowledgment timer delays. Zero disables a timer.
    pub fn configure_basics(&self, auto_acknowledge_delay: Duration, auto_unacknowledge_delay: Duration) {
        let mut core = self.inner.core.lock();
        core.auto_acknowledge_delay = auto_acknowledge_delay;
        core.auto_unacknowledge_delay = auto_unacknowledge_delay;
    }

    pub fn configure_escalation(&self, settings: Option<EscalationSettings>) {
        let mut core = self.inner.core.lock();
        core.state.escalation = settings;
    }

    pub fn set_observer(&self, observer: AlarmObserver) {
        *self.inner.observer.write() = Some(observer);
    }

    /// Start recording every accepted severity change in a bounded queue.
    ///
    /// Replaces any previous queue.
    pub fn init_severity_queue(&self, capacity: usize) -> SeverityQueue {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.inner.core.lock().severity_queue = Some(tx);
        SeverityQueue { rx }
    }

    pub fn snapshot(&self) -> AlarmSnapshot {
        self.inner.core.lock().state.clone()
    }

    pub fn severity(&self) -> Severity {
        self.inner.core.lock().state.severity
    }

    pub fn max_severity(&self) -> Severity {
        self.inner.core.lock().state.max_severity
    }

    pub fn reason(&self) -> String {
        self.inner.core.lock().state.reason.clone()
    }

    pub fn nominal(&self) -> bool {
        self.inner.core.lock().state.nominal()
    }

    pub fn is_acknowledged(&self) -> bool {
        self.inner.core.lock().state.acknowledged
    }

    pub fn is_escalated(&self) -> bool {
        self.inner.core.lock().state.escalated
    }

    pub fn is_muted(&self) -> bool {
        self.inner.core.lock().state.muted()
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.core.lock().suspended
    }

    pub fn pending_timers(&self) -> PendingTimers {
        let core = self.inner.core.lock();
        PendingTimers {
            auto_acknowledge: core.auto_acknowledge_timer.is_pending(),
            auto_unacknowledge: core.auto_unacknowledge_timer.is_pending(),
            escalation: core.escalation_timer.is_pending(),
            unmute: core.unmute_timer.is_pending(),
        }
    }

    /// Apply a new severity and reason.
    ///
    /// Returns true if the alarm changed. Re-applying the current severity
    /// and reason (or NONE while already NONE) changes nothing and does not
    /// notify the observer.
    pub fn set_severity(&self, severity: Severity, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let weak = Arc::downgrade(&self.inner);
        let mut core = self.inner.core.lock();
        if core.closed || core.suspended {
            debug!("Ignoring severity {} for inactive alarm {}", severity, self.name());
            return false;
        }
        let previous = core.state.severity;
        if !core.apply_severity(severity, reason, &weak) {
            return false;
        }
        debug!(
            "Alarm {} severity {} -> {} ({})",
            self.name(),
            previous,
            severity,
            core.state.reason
        );
        if let Some(queue) = &core.severity_queue {
            if let Err(e) = queue.try_send(severity) {
                warn!("Alarm {} severity queue rejected {}: {}", self.name(), severity, e);
            }
        }
        self.notify(core);
        true
    }

    /// Acknowledge the current excursion. No-op when nominal or already
    /// acknowledged.
    pub fn acknowledge(&self, by: &str) -> bool {
        let mut core = self.inner.core.lock();
        if core.closed || !core.apply_acknowledge(by) {
            return false;
        }
        info!("Alarm {} acknowledged by {}", self.name(), by);
        self.notify(core);
        true
    }

    /// Clear the acknowledgment. No-op when not acknowledged.
    pub fn unacknowledge(&self) -> bool {
        let weak = Arc::downgrade(&self.inner);
        let mut core = self.inner.core.lock();
        if core.closed || !core.apply_unacknowledge(&weak) {
            return false;
        }
        info!("Alarm {} unacknowledged", self.name());
        self.notify(core);
        true
    }

    /// Mute the alarm for `duration` at `severity`, replacing any earlier mute.
    ///
    /// Muting is display state for operators; it does not change severity,
    /// acknowledgment or escalation. The alarm unmutes itself when
    /// `duration` elapses.
    pub fn mute(&self, duration: Duration, severity: Severity, by: &str) -> Result<bool> {
        validate_mute(self.name(), duration, severity)?;
        let weak = Arc::downgrade(&self.inner);
        let mut core = self.inner.core.lock();
        if core.closed {
            return Ok(false);
        }
        core.unmute_timer.cancel();
        core.state.muted_severity = severity;
        core.state.muted_by = by.to_string();
        let expires = chrono::Duration::from_std(duration)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d));
        core.state.timestamp_unmute = expires;
        core.unmute_delay = duration;
        core.arm(Fired::Unmute, &weak);
        info!("Alarm {} muted at {} by {} for {:?}", self.name(), severity, by, duration);
        self.notify(core);
        Ok(true)
    }

    /// Clear the mute. No-op when not muted.
    pub fn unmute(&self) -> bool {
        let mut core = self.inner.core.lock();
        core.unmute_timer.cancel();
        if core.closed || !core.clear_mute() {
            return false;
        }
        info!("Alarm {} unmuted", self.name());
        self.notify(core);
        true
    }

    /// Stop reacting until [`Alarm::reset`]: severities are ignored and the
    /// acknowledgment and escalation timers are cancelled. State is kept
    /// as is and the observer is not called.
    pub fn suspend(&self) {
        let mut core = self.inner.core.lock();
        if core.suspended {
            return;
        }
        core.suspended = true;
        core.auto_acknowledge_timer.cancel();
        core.auto_unacknowledge_timer.cancel();
        core.escalation_timer.cancel();
        debug!("Alarm {} suspended", self.name());
    }

    /// Return to nominal, clearing acknowledgment, escalation and mute and
    /// cancelling every timer. Lifts a suspension. The observer is not
    /// called; the new state is returned instead.
    pub fn reset(&self) -> AlarmSnapshot {
        let mut core = self.inner.core.lock();
        let escalation = core.state.escalation.take();
        core.state = AlarmSnapshot::new(&self.inner.name);
        core.state.escalation = escalation;
        core.auto_acknowledge_timer.cancel();
        core.auto_unacknowledge_timer.cancel();
        core.escalation_timer.cancel();
        core.unmute_timer.cancel();
        core.suspended = false;
        debug!("Alarm {} reset", self.name());
        core.state.clone()
    }

    /// Cancel every timer and stop recording severities. Idempotent.
    pub fn close(&self) {
        let mut core = self.inner.core.lock();
        core.closed = true;
        core.auto_acknowledge_timer.cancel();
        core.auto_unacknowledge_timer.cancel();
        core.escalation_timer.cancel();
        core.unmute_timer.cancel();
        core.severity_queue = None;
    }

    fn notify(&self, core: parking_lot::MutexGuard<'_, AlarmCore>) {
        let snapshot = core.state.clone();
        let _order = self.inner.notify_order.lock();
        drop(core);
        let observer = self.inner.observer.read().clone();
        if let Some(observer) = observer {
            observer(&snapshot);
        }
    }

    fn fire(&self, timer: Fired, generation: u64) {
        let mut core = self.inner.core.lock();
        let slot = match timer {
            Fired::AutoAcknowledge => &mut core.auto_acknowledge_timer,
            Fired::AutoUnacknowledge => &mut core.auto_unacknowledge_timer,
            Fired::Escalation => &mut core.escalation_timer,
            Fired::Unmute => &mut core.unmute_timer,
        };
        if !slot.is_current(generation) {
            return;
        }
        slot.complete(generation);
        if core.suspended && timer != Fired::Unmute {
            return;
        }

        let changed = match timer {
            Fired::AutoAcknowledge => {
                let changed = core.apply_acknowledge(AUTOMATIC_USER);
                if changed {
                    info!("Alarm {} automatically acknowledged", self.name());
                }
                changed
            }
            Fired::AutoUnacknowledge => {
                core.state.severity == Severity::None && core.clear_bookkeeping()
            }
            Fired::Escalation => {
                let changed = core.escalation_due() && !core.state.escalated;
                if changed {
                    core.state.escalated = true;
                    warn!(
                        "Alarm {} escalated at severity {}: {}",
                        self.name(),
                        core.state.severity,
                        core.state.reason
                    );
                }
                changed
            }
            Fired::Unmute => {
                let changed = core.clear_mute();
                if changed {
                    info!("Alarm {} mute expired", self.name());
                }
                changed
            }
        };
        if changed {
            self.notify(core);
        }
    }
}

impl AlarmCore {
    fn apply_severity(&mut self, severity: Severity, reason: String, weak: &Weak<AlarmInner>) -> bool {
        let previous = self.state.severity;
        if severity == previous && (severity == Severity::None || reason == self.state.reason) {
            return false;
        }
        let now = Utc::now();
        if severity != previous {
            self.state.timestamp_severity_oldest = Some(now);
        }
        self.state.timestamp_severity_newest = Some(now);
        self.state.severity = severity;
        self.state.reason = reason;

        if severity == Severity::None {
            self.state.max_severity = Severity::None;
            self.auto_acknowledge_timer.cancel();
            self.escalation_timer.cancel();
            if self.auto_unacknowledge_delay.is_zero() {
                self.clear_bookkeeping();
            } else {
                self.arm(Fired::AutoUnacknowledge, weak);
            }
            return true;
        }

        if previous == Severity::None {
            self.auto_unacknowledge_timer.cancel();
            self.clear_bookkeeping();
        }
        if severity > self.state.max_severity {
            self.state.max_severity = severity;
            if self.state.acknowledged {
                self.clear_acknowledgment();
            }
        }
        if !self.state.acknowledged && !self.auto_acknowledge_timer.is_pending() {
            self.arm(Fired::AutoAcknowledge, weak);
        }
        self.update_escalation_timer(weak);
        true
    }

    fn apply_acknowledge(&mut self, by: &str) -> bool {
        if self.state.severity == Severity::None || self.state.acknowledged {
            return false;
        }
        self.state.acknowledged = true;
        self.state.acknowledged_by = by.to_string();
        self.state.timestamp_acknowledged = Some(Utc::now());
        self.auto_acknowledge_timer.cancel();
        self.escalation_timer.cancel();
        true
    }

    fn apply_unacknowledge(&mut self, weak: &Weak<AlarmInner>) -> bool {
        if !self.state.acknowledged {
            return false;
        }
        if self.state.severity == Severity::None {
            self.auto_unacknowledge_timer.cancel();
            self.clear_bookkeeping();
        } else {
            self.clear_acknowledgment();
            if !self.auto_acknowledge_timer.is_pending() {
                self.arm(Fired::AutoAcknowledge, weak);
            }
            self.update_escalation_timer(weak);
        }
        true
    }

    fn clear_acknowledgment(&mut self) {
        self.state.acknowledged = false;
        self.state.acknowledged_by.clear();
        self.state.timestamp_acknowledged = None;
    }

    /// Reset ack and escalation bookkeeping; true if anything changed
    fn clear_bookkeeping(&mut self) -> bool {
        let dirty = self.state.acknowledged || !self.state.acknowledged_by.is_empty() || self.state.escalated;
        self.clear_acknowledgment();
        self.state.escalated = false;
        dirty
    }

    fn clear_mute(&mut self) -> bool {
        let was_muted = self.state.muted();
        self.state.muted_severity = Severity::None;
        self.state.muted_by.clear();
        self.state.timestamp_unmute = None;
        was_muted
    }

    fn escalation_due(&self) -> bool {
        match &self.state.escalation {
            Some(settings) => {
                settings.is_enabled()
                    && self.state.severity >= settings.threshold
                    && !self.state.acknowledged
            }
            None => false,
        }
    }

    fn update_escalation_timer(&mut self, weak: &Weak<AlarmInner>) {
        if !self.escalation_due() {
            self.escalation_timer.cancel();
        } else if !self.state.escalated && !self.escalation_timer.is_pending() {
            self.arm(Fired::Escalation, weak);
        }
    }

    fn arm(&mut self, timer: Fired, weak: &Weak<AlarmInner>) {
        if self.closed || (self.suspended && timer != Fired::Unmute) {
            return;
        }
        let (slot, delay) = match timer {
            Fired::AutoAcknowledge => (&mut self.auto_acknowledge_timer, self.auto_acknowledge_delay),
            Fired::AutoUnacknowledge => (&mut self.auto_unacknowledge_timer, self.auto_unacknowledge_delay),
            Fired::Escalation => {
                let delay = self
                    .state
                    .escalation
                    .as_ref()
                    .map(|s| s.delay)
                    .unwrap_or_default();
                (&mut self.escalation_timer, delay)
            }
            Fired::Unmute => (&mut self.unmute_timer, self.unmute_delay),
        };
        if delay.is_zero() {
            return;
        }
        let weak = weak.clone();
        slot.spawn(move |generation| async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                Alarm { inner }.fire(timer, generation);
            }
        });
    }
}

// ============================================================================
// TEST OBSERVATION QUEUE
// ============================================================================

/// Receiving end of an alarm's severity queue
pub struct SeverityQueue {
    rx: mpsc::Receiver<Severity>,
}

impl SeverityQueue {
    /// Wait up to `timeout` for the next recorded severity
    pub async fn next_severity(&mut self, timeout: Duration) -> Result<Severity> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(severity)) => Ok(severity),
            Ok(None) => Err(WatcherError::Config("severity queue closed".to_string())),
            Err(_) => Err(WatcherError::Timeout(timeout)),
        }
    }

    pub fn try_next(&mut self) -> Option<Severity> {
        self.rx.try_recv().ok()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
