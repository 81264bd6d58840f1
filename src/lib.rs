//! Watchkeeper - rule-driven alarm engine
//!
//! Rules subscribe to topics on a publish/subscribe bus, evaluate each
//! delivered sample and drive one severity-graded [`Alarm`] apiece. Alarms
//! track acknowledgment, acknowledge themselves after a delay, reset after
//! returning to NONE, and escalate to a paging service when they stay severe
//! for too long.
//!
//! # Examples
//!
//! ```rust
//! use std::sync::Arc;
//! use watchkeeper::{LocalBus, LogPager, Model, RuleRegistry, Sample, TopicKey, TopicSchema, ValueType, WatcherConfig};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> watchkeeper::Result<()> {
//! let bus = LocalBus::new();
//! bus.declare_topic("ATDome", "evt_summaryState", TopicSchema::new().field("summaryState", ValueType::Int));
//!
//! let config = WatcherConfig::from_yaml("rules:\n  - classname: Enabled\n    configs:\n      - name: ATDome\n")?;
//! let mut model = Model::new(&config, Arc::new(bus.clone()), &RuleRegistry::builtin(), Arc::new(LogPager))?;
//! model.enable();
//!
//! bus.publish(&TopicKey::new("ATDome", 0, "evt_summaryState"), Sample::new().with("summaryState", 3i64))?;
//! model.process_pending();
//! assert!(!model.alarm("Enabled.ATDome:0").unwrap().nominal());
//! # Ok(())
//! # }
//! ```

// ============================================================================
// CORE MODULES
// ============================================================================

/// Error type shared by every module
pub mod error;

/// Sample values, topic schemas and topic identities
pub mod value;

/// Publish/subscribe boundary and the in-memory bus
pub mod bus;

/// Cancel-and-reschedule slots for background tasks
pub mod task;

// ============================================================================
// ALARMS AND RULES
// ============================================================================

/// Alarm state machine with acknowledgment and escalation timers
pub mod alarm;

/// Static description of the topics a rule reads
pub mod remote_info;

/// Per-source subscription sets
pub mod remote_wrapper;

/// Per-key sample caches for multiplexed topics
pub mod filtered_topic_wrapper;

/// Fan-out from one callback topic to its rules
pub mod topic_callback;

/// Rule trait and class registry
pub mod rule;

/// Fixed-interval evaluation for rules without callback topics
pub mod polling;

/// Built-in rule classes
pub mod rules;

/// Rule wiring and sample dispatch
pub mod model;

// ============================================================================
// CONFIGURATION AND ESCALATION
// ============================================================================

/// YAML configuration document
pub mod config;

/// JSON schema validation
pub mod config_schema;

/// Paging collaborator and the escalation worker
pub mod escalation;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use alarm::{Alarm, AlarmSnapshot, EscalationSettings, PendingTimers, ResolvePolicy, Severity, SeverityQueue};
pub use bus::{Bus, DeliveryCallback, LocalBus, TopicHandle};
pub use config::{EscalationConfig, RetryConfig, RuleSpec, WatcherConfig};
pub use error::{Result, WatcherError};
pub use escalation::{Escalator, IncidentRequest, IncidentState, LogPager, Pager, RecordingPager};
pub use filtered_topic_wrapper::{FilterKey, FilteredTopicWrapper};
pub use model::{Model, ModelHandle, ModelStats, Wiring};
pub use polling::PollingLoop;
pub use remote_info::{RemoteInfo, SourceKey, TopicKind};
pub use remote_wrapper::RemoteWrapper;
pub use rule::{Rule, RuleBase, RuleClass, RuleRegistry, SeverityUpdate, SharedRule};
pub use topic_callback::{DispatchReport, TopicCallback};
pub use value::{Sample, TopicKey, TopicSchema, Value, ValueType};

// ============================================================================
// VERSION INFORMATION
// ============================================================================

/// Crate version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// INITIALIZATION
// ============================================================================

/// Install a tracing subscriber filtered by `RUST_LOG`, defaulting to
/// `watchkeeper=info`. Does nothing if a subscriber is already installed.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("watchkeeper=info"));
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false));

    if subscriber.try_init().is_ok() {
        tracing::info!("watchkeeper {} logging initialized", VERSION);
    }
}
