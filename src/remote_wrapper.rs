// src/remote_wrapper.rs - One subscription set per (source, index)
use crate::{
    bus::{Bus, TopicHandle},
    error::{Result, WatcherError},
    remote_info::SourceKey,
    value::{Sample, TopicKey},
};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Proxy over the topics one source instance publishes.
///
/// The model grows the subscribed set during wiring and then shares the
/// wrapper read-only (behind `Arc`) with every rule that reads the source.
/// A topic name is subscribed at most once, and the set never shrinks.
pub struct RemoteWrapper {
    key: SourceKey,
    bus: Arc<dyn Bus>,
    topics: BTreeMap<String, TopicHandle>,
}

impl RemoteWrapper {
    pub fn new(key: SourceKey, bus: Arc<dyn Bus>) -> Self {
        Self {
            key,
            bus,
            topics: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> &SourceKey {
        &self.key
    }

    /// `lowercase(source)_index`
    pub fn attr_name(&self) -> String {
        self.key.attr_name()
    }

    /// Subscribe to every name in `topic_names` not already subscribed
    pub fn add_topics<'a>(&mut self, topic_names: impl IntoIterator<Item = &'a str>) -> Result<()> {
        for name in topic_names {
            if self.topics.contains_key(name) {
                continue;
            }
            let handle = self
                .bus
                .subscribe(&TopicKey::new(self.key.name.clone(), self.key.index, name))?;
            debug!("RemoteWrapper {} subscribed to {}", self.key, name);
            self.topics.insert(name.to_string(), handle);
        }
        Ok(())
    }

    pub fn has_topic(&self, topic_name: &str) -> bool {
        self.topics.contains_key(topic_name)
    }

    pub fn topic_names(&self) -> impl Iterator<Item = &str> {
        self.topics.keys().map(String::as_str)
    }

    pub fn handle(&self, topic_name: &str) -> Option<&TopicHandle> {
        self.topics.get(topic_name)
    }

    /// Latest sample of a subscribed topic.
    ///
    /// `Ok(None)` means no data yet; an unsubscribed name is an error.
    pub fn get(&self, topic_name: &str) -> Result<Option<Sample>> {
        let handle = self.topics.get(topic_name).ok_or_else(|| {
            WatcherError::UnknownTopic(format!("{} is not subscribed by {}", topic_name, self.key))
        })?;
        Ok(self.bus.get_current(handle))
    }
}

impl fmt::Debug for RemoteWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteWrapper")
            .field("key", &self.key)
            .field("topics", &self.topics.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use crate::value::TopicSchema;

    fn bus() -> LocalBus {
        let bus = LocalBus::new();
        for name in ["evt_heartbeat", "evt_summaryState", "tel_position"] {
            bus.declare_topic("ATDome", name, TopicSchema::new());
        }
        bus
    }

    #[test]
    fn test_growth_never_resubscribes() {
        let bus = bus();
        let mut wrapper = RemoteWrapper::new(SourceKey::new("ATDome", 0), Arc::new(bus.clone()));
        assert_eq!(wrapper.attr_name(), "atdome_0");

        wrapper.add_topics(["evt_heartbeat", "tel_position"]).unwrap();
        wrapper.add_topics(["evt_heartbeat", "evt_summaryState"]).unwrap();
        assert_eq!(
            wrapper.topic_names().collect::<Vec<_>>(),
            vec!["evt_heartbeat", "evt_summaryState", "tel_position"]
        );
        for name in ["evt_heartbeat", "evt_summaryState", "tel_position"] {
            assert_eq!(bus.subscription_count(&TopicKey::new("ATDome", 0, name)), 1);
        }
    }

    #[test]
    fn test_no_data_yet_sentinel() {
        let bus = bus();
        let mut wrapper = RemoteWrapper::new(SourceKey::new("ATDome", 0), Arc::new(bus.clone()));
        wrapper.add_topics(["tel_position"]).unwrap();
        assert_eq!(wrapper.get("tel_position").unwrap(), None);
        assert!(wrapper.get("evt_heartbeat").is_err());

        bus.publish(&TopicKey::new("ATDome", 0, "tel_position"), Sample::new().with("azimuth", 5.0))
            .unwrap();
        assert!(wrapper.get("tel_position").unwrap().is_some());
    }

    #[test]
    fn test_unknown_topic_fails() {
        let mut wrapper = RemoteWrapper::new(SourceKey::new("ATDome", 0), Arc::new(bus()));
        assert!(wrapper.add_topics(["tel_missing"]).is_err());
    }
}
