// src/escalation.rs - Paging collaborator and the escalation worker
//
// Alarms never call the pager themselves. Every accepted alarm transition is
// published as a snapshot; the Escalator turns those snapshots into trigger
// and resolve calls, retried with backoff in background tasks. Paging
// failures are logged and never flow back into alarm state.

use crate::{
    alarm::{AlarmSnapshot, ResolvePolicy, Severity},
    config::RetryConfig,
    error::{Result, WatcherError},
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

// ============================================================================
// PAGER BOUNDARY
// ============================================================================

/// Payload of one trigger-incident call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IncidentRequest {
    pub alarm_name: String,
    pub message: String,
    pub description: String,
    pub responder_tags: BTreeMap<String, String>,
}

impl IncidentRequest {
    pub fn for_alarm(snapshot: &AlarmSnapshot, responder: &str) -> Self {
        let mut responder_tags = BTreeMap::new();
        responder_tags.insert("responder".to_string(), responder.to_string());
        responder_tags.insert("alarm_name".to_string(), snapshot.name.clone());
        Self {
            alarm_name: snapshot.name.clone(),
            message: format!("Watcher alarm {} escalated", snapshot.name),
            description: snapshot.reason.clone(),
            responder_tags,
        }
    }
}

/// External incident/paging service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Pager: Send + Sync {
    /// Open an incident; returns its id
    async fn trigger_incident(&self, request: &IncidentRequest) -> Result<String>;

    async fn resolve_incident(&self, incident_id: &str) -> Result<()>;
}

/// Pager that only writes to the log
#[derive(Debug, Default)]
pub struct LogPager;

#[async_trait]
impl Pager for LogPager {
    async fn trigger_incident(&self, request: &IncidentRequest) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        warn!(
            "Incident {} opened for {} (responder {}): {}",
            id,
            request.alarm_name,
            request
                .responder_tags
                .get("responder")
                .map(String::as_str)
                .unwrap_or("?"),
            request.description
        );
        Ok(id)
    }

    async fn resolve_incident(&self, incident_id: &str) -> Result<()> {
        info!("Incident {} resolved", incident_id);
        Ok(())
    }
}

/// In-memory pager that records every call; can be told to fail triggers
#[derive(Debug, Default)]
pub struct RecordingPager {
    triggered: Mutex<Vec<IncidentRequest>>,
    resolved: Mutex<Vec<String>>,
    open: Mutex<HashMap<String, String>>,
    failures_left: AtomicU32,
}

impl RecordingPager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` trigger calls fail
    pub fn fail_next_triggers(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn triggered(&self) -> Vec<IncidentRequest> {
        self.triggered.lock().clone()
    }

    pub fn resolved(&self) -> Vec<String> {
        self.resolved.lock().clone()
    }

    /// Open incident ids keyed by alarm name
    pub fn open_incidents(&self) -> HashMap<String, String> {
        self.open
            .lock()
            .iter()
            .map(|(id, alarm)| (alarm.clone(), id.clone()))
            .collect()
    }
}

#[async_trait]
impl Pager for RecordingPager {
    async fn trigger_incident(&self, request: &IncidentRequest) -> Result<String> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(WatcherError::Paging("simulated trigger failure".to_string()));
        }
        let id = uuid::Uuid::new_v4().to_string();
        self.triggered.lock().push(request.clone());
        self.open.lock().insert(id.clone(), request.alarm_name.clone());
        Ok(id)
    }

    async fn resolve_incident(&self, incident_id: &str) -> Result<()> {
        if self.open.lock().remove(incident_id).is_none() {
            return Err(WatcherError::Paging(format!("no open incident {}", incident_id)));
        }
        self.resolved.lock().push(incident_id.to_string());
        Ok(())
    }
}

// ============================================================================
// RETRY
// ============================================================================

/// Run `op` until it succeeds or `retry.max_attempts` is reached.
///
/// Each attempt is bounded by `timeout`; a timeout counts as a failure.
pub async fn with_retry<T, F, Fut>(
    retry: &RetryConfig,
    timeout: Duration,
    what: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 0;
    let mut delay = retry.initial_delay_ms;

    loop {
        attempt += 1;
        let result = match tokio::time::timeout(timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(WatcherError::Timeout(timeout)),
        };
        match result {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt >= max_attempts {
                    error!("{} failed after {} attempts: {}", what, attempt, e);
                    return Err(e);
                }
                warn!("{} failed (attempt {}/{}): {}", what, attempt, max_attempts, e);

                tokio::time::sleep(Duration::from_millis(delay)).await;

                if retry.exponential_backoff {
                    delay = ((delay as f64 * retry.backoff_multiplier) as u64).min(retry.max_delay_ms);
                }
            }
        }
    }
}

// ============================================================================
// INCIDENT REGISTRY
// ============================================================================

/// Paging state of one alarm
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncidentState {
    /// Trigger call in flight
    Triggering,
    /// Incident open with this id
    Open(String),
    /// Trigger gave up; not retried until the alarm stops wanting escalation
    Failed(String),
}

#[derive(Debug)]
struct IncidentEntry {
    state: IncidentState,
    wanted: bool,
}

/// Shared view of incident state per alarm name
#[derive(Debug, Clone, Default)]
pub struct IncidentRegistry {
    entries: Arc<Mutex<HashMap<String, IncidentEntry>>>,
}

impl IncidentRegistry {
    pub fn state(&self, alarm_name: &str) -> Option<IncidentState> {
        self.entries.lock().get(alarm_name).map(|e| e.state.clone())
    }

    pub fn incident_id(&self, alarm_name: &str) -> Option<String> {
        match self.state(alarm_name) {
            Some(IncidentState::Open(id)) => Some(id),
            _ => None,
        }
    }
}

/// Whether an alarm in this state should have an open incident
pub fn wants_incident(snapshot: &AlarmSnapshot) -> bool {
    let Some(settings) = &snapshot.escalation else {
        return false;
    };
    snapshot.escalated
        && snapshot.severity != Severity::None
        && !(settings.resolve_on == ResolvePolicy::Acknowledged && snapshot.acknowledged)
}

// ============================================================================
// ESCALATOR
// ============================================================================

/// Turns alarm snapshots into paging calls, one open incident per alarm
#[derive(Clone)]
pub struct Escalator {
    pager: Arc<dyn Pager>,
    retry: RetryConfig,
    timeout: Duration,
    incidents: IncidentRegistry,
}

impl Escalator {
    pub fn new(pager: Arc<dyn Pager>, retry: RetryConfig, timeout: Duration) -> Self {
        Self {
            pager,
            retry,
            timeout,
            incidents: IncidentRegistry::default(),
        }
    }

    pub fn incidents(&self) -> IncidentRegistry {
        self.incidents.clone()
    }

    /// Consume snapshots until every sender is dropped
    pub fn spawn(self, mut snapshots: mpsc::UnboundedReceiver<AlarmSnapshot>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(snapshot) = snapshots.recv().await {
                self.handle(&snapshot);
            }
            debug!("Escalation worker stopped");
        })
    }

    /// React to one alarm transition. Paging happens in background tasks.
    pub fn handle(&self, snapshot: &AlarmSnapshot) {
        let wanted = wants_incident(snapshot);
        let mut entries = self.incidents.entries.lock();
        let Some(entry) = entries.get_mut(&snapshot.name) else {
            if wanted {
                let responder = snapshot
                    .escalation
                    .as_ref()
                    .map(|s| s.responder.clone())
                    .unwrap_or_default();
                entries.insert(
                    snapshot.name.clone(),
                    IncidentEntry {
                        state: IncidentState::Triggering,
                        wanted: true,
                    },
                );
                drop(entries);
                self.spawn_trigger(IncidentRequest::for_alarm(snapshot, &responder));
            }
            return;
        };

        entry.wanted = wanted;
        if wanted {
            return;
        }
        match entry.state.clone() {
            IncidentState::Open(id) => {
                entries.remove(&snapshot.name);
                drop(entries);
                self.spawn_resolve(snapshot.name.clone(), id);
            }
            IncidentState::Failed(_) => {
                entries.remove(&snapshot.name);
            }
            // Resolved when the trigger completes
            IncidentState::Triggering => {}
        }
    }

    fn spawn_trigger(&self, request: IncidentRequest) {
        let this = self.clone();
        tokio::spawn(async move {
            let what = format!("Triggering incident for {}", request.alarm_name);
            let pager = this.pager.clone();
            let result = with_retry(&this.retry, this.timeout, &what, || {
                let pager = pager.clone();
                let request = request.clone();
                async move { pager.trigger_incident(&request).await }
            })
            .await;

            let name = request.alarm_name;
            let orphan = {
                let mut entries = this.incidents.entries.lock();
                let still_wanted = entries.get(&name).map(|e| e.wanted).unwrap_or(false);
                match (result, still_wanted) {
                    (Ok(id), true) => {
                        info!("Alarm {} paged; incident {}", name, id);
                        if let Some(entry) = entries.get_mut(&name) {
                            entry.state = IncidentState::Open(id);
                        }
                        None
                    }
                    (Ok(id), false) => {
                        entries.remove(&name);
                        Some(id)
                    }
                    (Err(e), true) => {
                        if let Some(entry) = entries.get_mut(&name) {
                            entry.state = IncidentState::Failed(e.to_string());
                        }
                        None
                    }
                    (Err(_), false) => {
                        entries.remove(&name);
                        None
                    }
                }
            };
            if let Some(id) = orphan {
                debug!("Alarm {} recovered while paging; resolving {}", name, id);
                this.resolve(&name, &id).await;
            }
        });
    }

    fn spawn_resolve(&self, alarm_name: String, incident_id: String) {
        let this = self.clone();
        tokio::spawn(async move {
            this.resolve(&alarm_name, &incident_id).await;
        });
    }

    async fn resolve(&self, alarm_name: &str, incident_id: &str) {
        let what = format!("Resolving incident {} for {}", incident_id, alarm_name);
        let pager = self.pager.clone();
        let result = with_retry(&self.retry, self.timeout, &what, || {
            let pager = pager.clone();
            let id = incident_id.to_string();
            async move { pager.resolve_incident(&id).await }
        })
        .await;
        if result.is_ok() {
            info!("Incident {} for {} resolved", incident_id, alarm_name);
        }
    }
}
