// src/polling.rs - Fixed-interval evaluation for rules that read poll topics
//
// A polling rule has no callback topic, so nothing on the bus ever runs it.
// Instead `start` hands a PollingLoop an evaluation closure; the loop calls
// it, applies the result to the rule's alarm, then sleeps for the interval.
// A failing or panicking evaluation is logged and the loop carries on.
use crate::{
    alarm::Alarm,
    error::{Result, WatcherError},
    rule::SeverityUpdate,
    task::TaskSlot,
    topic_callback::panic_message,
};
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;
use tracing::{debug, error};

pub struct PollingLoop {
    interval: Duration,
    task: TaskSlot,
}

impl PollingLoop {
    /// Fails if `interval` is zero
    pub fn new(interval: Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(WatcherError::Config("poll interval must be positive".to_string()));
        }
        Ok(Self {
            interval,
            task: TaskSlot::new("polling loop"),
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start polling, replacing any loop already running. The first
    /// evaluation happens at once.
    pub fn start<P>(&mut self, alarm: Alarm, mut poller: P)
    where
        P: FnMut() -> Result<SeverityUpdate> + Send + 'static,
    {
        let interval = self.interval;
        self.task.spawn(move |_| async move {
            debug!("Polling for {} every {:?}", alarm.name(), interval);
            loop {
                poll_once(&alarm, &mut poller);
                tokio::time::sleep(interval).await;
            }
        });
    }

    pub fn stop(&mut self) {
        self.task.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.task.is_pending()
    }
}

/// Run one evaluation and apply it; true if the alarm changed
fn poll_once<P>(alarm: &Alarm, poller: &mut P) -> bool
where
    P: FnMut() -> Result<SeverityUpdate>,
{
    match panic::catch_unwind(AssertUnwindSafe(|| poller())) {
        Ok(Ok(SeverityUpdate::Changed(severity, reason))) => alarm.set_severity(severity, reason),
        Ok(Ok(SeverityUpdate::Unchanged)) => false,
        Ok(Err(e)) => {
            error!("Polling {} failed: {}", alarm.name(), e);
            false
        }
        Err(payload) => {
            error!("Polling {} panicked: {}", alarm.name(), panic_message(payload.as_ref()));
            false
        }
    }
}
