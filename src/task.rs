// src/task.rs - Cancel-and-reschedule task slots for timers and rule tasks
use std::future::Future;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

/// Holds at most one background task of one kind.
///
/// Spawning aborts whatever was pending first. Each spawn bumps a generation
/// counter that is handed to the task; a task that wakes up after being
/// superseded sees a stale generation through [`TaskSlot::is_current`] and
/// must do nothing. Cancelling an empty slot is a no-op, and dropping the
/// slot aborts the pending task.
#[derive(Debug)]
pub struct TaskSlot {
    name: &'static str,
    handle: Option<JoinHandle<()>>,
    generation: u64,
}

impl TaskSlot {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            handle: None,
            generation: 0,
        }
    }

    /// Cancel any pending task and spawn a new one on the current runtime.
    ///
    /// Returns false when no Tokio runtime is available; the slot is then
    /// left empty.
    pub fn spawn<F, Fut>(&mut self, make: F) -> bool
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                trace!("Arming {} (generation {})", self.name, self.generation);
                self.handle = Some(runtime.spawn(make(self.generation)));
                true
            }
            Err(e) => {
                warn!("Cannot arm {}: no async runtime ({})", self.name, e);
                false
            }
        }
    }

    /// Abort the pending task, if any. Safe to call repeatedly.
    pub fn cancel(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        if let Some(handle) = self.handle.take() {
            trace!("Cancelling {}", self.name);
            handle.abort();
        }
    }

    /// Generation handed to the most recent spawn
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether `generation` is still the live spawn of this slot
    pub fn is_current(&self, generation: u64) -> bool {
        self.handle.is_some() && self.generation == generation
    }

    /// Called by a task that has fired; releases the slot without aborting
    /// the caller.
    pub fn complete(&mut self, generation: u64) {
        if self.generation == generation {
            self.handle = None;
        }
    }

    pub fn is_pending(&self) -> bool {
        self.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }
}

impl Drop for TaskSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}
