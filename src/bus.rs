// src/bus.rs - Publish/subscribe bus boundary and an in-memory implementation
use crate::{
    error::{Result, WatcherError},
    value::{Sample, TopicKey, TopicSchema},
};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Function the bus calls with every sample delivered on a topic
pub type DeliveryCallback = Arc<dyn Fn(&Sample) + Send + Sync>;

/// A live subscription: the topic identity plus its sample schema
#[derive(Debug, Clone, PartialEq)]
pub struct TopicHandle {
    key: TopicKey,
    schema: Arc<TopicSchema>,
}

impl TopicHandle {
    pub fn new(key: TopicKey, schema: Arc<TopicSchema>) -> Self {
        Self { key, schema }
    }

    pub fn key(&self) -> &TopicKey {
        &self.key
    }

    pub fn schema(&self) -> &TopicSchema {
        &self.schema
    }
}

/// Boundary to the publish/subscribe transport.
///
/// Implementations must accept repeated `set_callback` calls for one handle
/// by replacing the previous callback.
pub trait Bus: Send + Sync {
    /// Subscribe to a topic; fails for topics the bus does not know
    fn subscribe(&self, topic: &TopicKey) -> Result<TopicHandle>;

    /// Route future deliveries on `handle` to `callback`
    fn set_callback(&self, handle: &TopicHandle, callback: DeliveryCallback) -> Result<()>;

    /// Latest sample seen on `handle`, if any
    fn get_current(&self, handle: &TopicHandle) -> Option<Sample>;
}

// ============================================================================
// IN-MEMORY BUS
// ============================================================================

/// Thread-safe in-memory bus used for tests, simulations and replay.
///
/// Topics must be declared per (source name, topic name) before anyone can
/// subscribe; any index of a declared source is accepted.
///
/// # Examples
///
/// ```rust
/// use watchkeeper::{Bus, LocalBus, Sample, TopicKey, TopicSchema, ValueType};
///
/// let bus = LocalBus::new();
/// bus.declare_topic("ATDome", "tel_position", TopicSchema::new().field("azimuth", ValueType::Float));
///
/// let key = TopicKey::new("ATDome", 0, "tel_position");
/// let handle = bus.subscribe(&key)?;
/// bus.publish(&key, Sample::new().with("azimuth", 12.5))?;
/// assert_eq!(bus.get_current(&handle).unwrap().get_float("azimuth"), Some(12.5));
/// # Ok::<(), watchkeeper::WatcherError>(())
/// ```
#[derive(Clone, Default)]
pub struct LocalBus {
    schemas: Arc<DashMap<(String, String), Arc<TopicSchema>>>,
    current: Arc<DashMap<TopicKey, Sample>>,
    callbacks: Arc<DashMap<TopicKey, DeliveryCallback>>,
    subscriptions: Arc<DashMap<TopicKey, usize>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a topic available for every index of `source`
    pub fn declare_topic(&self, source: &str, topic_name: &str, schema: TopicSchema) {
        debug!("Declaring topic {}/{}", source, topic_name);
        self.schemas
            .insert((source.to_string(), topic_name.to_string()), Arc::new(schema));
    }

    /// Store `sample` as the latest value and deliver it to the callback
    pub fn publish(&self, topic: &TopicKey, sample: Sample) -> Result<()> {
        if !self.is_declared(topic) {
            return Err(WatcherError::UnknownTopic(topic.to_string()));
        }
        trace!("Publishing {} = {}", topic, sample);
        self.current.insert(topic.clone(), sample.clone());
        // Clone the callback out so no map shard stays locked while it runs
        let callback = self.callbacks.get(topic).map(|entry| entry.value().clone());
        if let Some(callback) = callback {
            callback(&sample);
        }
        Ok(())
    }

    /// How many times `topic` has been subscribed
    pub fn subscription_count(&self, topic: &TopicKey) -> usize {
        self.subscriptions.get(topic).map(|c| *c).unwrap_or(0)
    }

    pub fn has_callback(&self, topic: &TopicKey) -> bool {
        self.callbacks.contains_key(topic)
    }

    fn is_declared(&self, topic: &TopicKey) -> bool {
        self.schemas
            .contains_key(&(topic.source.clone(), topic.name.clone()))
    }
}

impl Bus for LocalBus {
    fn subscribe(&self, topic: &TopicKey) -> Result<TopicHandle> {
        let schema = self
            .schemas
            .get(&(topic.source.clone(), topic.name.clone()))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| WatcherError::UnknownTopic(topic.to_string()))?;
        *self.subscriptions.entry(topic.clone()).or_insert(0) += 1;
        debug!("Subscribed to {}", topic);
        Ok(TopicHandle::new(topic.clone(), schema))
    }

    fn set_callback(&self, handle: &TopicHandle, callback: DeliveryCallback) -> Result<()> {
        self.callbacks.insert(handle.key().clone(), callback);
        Ok(())
    }

    fn get_current(&self, handle: &TopicHandle) -> Option<Sample> {
        self.current
            .get(handle.key())
            .map(|entry| entry.value().clone())
    }
}
