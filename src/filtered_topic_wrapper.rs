// src/filtered_topic_wrapper.rs - Per-key cache for multiplexed topics
use crate::{
    bus::TopicHandle,
    error::{Result, WatcherError},
    value::{Sample, TopicKey, Value},
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use tracing::trace;

/// Hashable form of a filter field value.
///
/// Floats are keyed on their bit pattern, with `-0.0` folded into `0.0` and
/// every NaN folded into one key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FilterKey {
    Bool(bool),
    Int(i64),
    Float(u64),
    Str(String),
}

impl FilterKey {
    fn from_value(value: &Value) -> Option<Self> {
        if !value.value_type().is_scalar() {
            return None;
        }
        Some(match value {
            Value::Bool(b) => FilterKey::Bool(*b),
            Value::Int(i) => FilterKey::Int(*i),
            Value::Float(f) => FilterKey::from(*f),
            Value::String(s) => FilterKey::Str(s.clone()),
            Value::Array(_) => return None,
        })
    }
}

impl From<i64> for FilterKey {
    fn from(v: i64) -> Self {
        FilterKey::Int(v)
    }
}

impl From<f64> for FilterKey {
    fn from(v: f64) -> Self {
        let canonical = if v.is_nan() {
            f64::NAN
        } else if v == 0.0 {
            0.0
        } else {
            v
        };
        FilterKey::Float(canonical.to_bits())
    }
}

impl From<bool> for FilterKey {
    fn from(v: bool) -> Self {
        FilterKey::Bool(v)
    }
}

impl From<&str> for FilterKey {
    fn from(v: &str) -> Self {
        FilterKey::Str(v.to_string())
    }
}

impl fmt::Display for FilterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterKey::Bool(b) => write!(f, "{}", b),
            FilterKey::Int(i) => write!(f, "{}", i),
            FilterKey::Float(bits) => write!(f, "{}", f64::from_bits(*bits)),
            FilterKey::Str(s) => write!(f, "{}", s),
        }
    }
}

/// Latest sample per value of `filter_field`, for topics on which several
/// logical instances publish.
///
/// Updates are last-write-wins per key and never touch other keys. The
/// model creates at most one wrapper per (topic, filter field) and feeds it
/// from the topic's callback before any rule runs.
pub struct FilteredTopicWrapper {
    topic: TopicKey,
    filter_field: String,
    default: Option<Sample>,
    cache: RwLock<HashMap<FilterKey, Sample>>,
}

impl FilteredTopicWrapper {
    /// Fails if `filter_field` is not in the topic schema or is not a scalar
    pub fn new(handle: &TopicHandle, filter_field: &str, default: Option<Sample>) -> Result<Self> {
        match handle.schema().field_type(filter_field) {
            None => Err(WatcherError::InvalidFilterField(format!(
                "{} has no field {}",
                handle.key(),
                filter_field
            ))),
            Some(value_type) if !value_type.is_scalar() => Err(WatcherError::InvalidFilterField(format!(
                "{} field {} is a {:?}, not a scalar",
                handle.key(),
                filter_field,
                value_type
            ))),
            Some(_) => Ok(Self {
                topic: handle.key().clone(),
                filter_field: filter_field.to_string(),
                default,
                cache: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn topic(&self) -> &TopicKey {
        &self.topic
    }

    pub fn filter_field(&self) -> &str {
        &self.filter_field
    }

    /// Cache `sample` under the value of its filter field
    pub fn update(&self, sample: &Sample) -> Result<()> {
        let key = sample
            .get(&self.filter_field)
            .ok_or_else(|| WatcherError::MissingField {
                topic: self.topic.to_string(),
                field: self.filter_field.clone(),
            })
            .and_then(|value| {
                FilterKey::from_value(value).ok_or_else(|| {
                    WatcherError::InvalidFilterField(format!(
                        "{} field {} has unusable value {}",
                        self.topic, self.filter_field, value
                    ))
                })
            })?;
        trace!("{} [{}={}] updated", self.topic, self.filter_field, key);
        self.cache.write().insert(key, sample.clone());
        Ok(())
    }

    /// Cached sample for `key`, or the configured default if unseen
    pub fn get_data(&self, key: &FilterKey) -> Option<Sample> {
        self.cache
            .read()
            .get(key)
            .cloned()
            .or_else(|| self.default.clone())
    }

    pub fn keys(&self) -> Vec<FilterKey> {
        self.cache.read().keys().cloned().collect()
    }
}

impl fmt::Debug for FilteredTopicWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilteredTopicWrapper")
            .field("topic", &self.topic)
            .field("filter_field", &self.filter_field)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{TopicSchema, ValueType};
    use std::sync::Arc;

    fn handle() -> TopicHandle {
        TopicHandle::new(
            TopicKey::new("MTAirCompressor", 0, "tel_analogData"),
            Arc::new(
                TopicSchema::new()
                    .field("salIndex", ValueType::Int)
                    .field("linePressure", ValueType::Float)
                    .field("samples", ValueType::Array),
            ),
        )
    }

    #[test]
    fn test_construction_checks_filter_field() {
        assert!(FilteredTopicWrapper::new(&handle(), "salIndex", None).is_ok());
        assert!(matches!(
            FilteredTopicWrapper::new(&handle(), "missing", None),
            Err(WatcherError::InvalidFilterField(_))
        ));
        assert!(FilteredTopicWrapper::new(&handle(), "samples", None).is_err());
        assert!(FilteredTopicWrapper::new(&handle(), "linePressure", None).is_ok());
    }

    #[test]
    fn test_float_filter_field() {
        let handle = TopicHandle::new(
            TopicKey::new("ESS", 0, "tel_temperature"),
            Arc::new(
                TopicSchema::new()
                    .field("location", ValueType::Float)
                    .field("temperature", ValueType::Float),
            ),
        );
        let wrapper = FilteredTopicWrapper::new(&handle, "location", None).unwrap();
        wrapper
            .update(&Sample::new().with("location", 1.5).with("temperature", 12.0))
            .unwrap();
        wrapper
            .update(&Sample::new().with("location", 2.5).with("temperature", 14.0))
            .unwrap();
        wrapper
            .update(&Sample::new().with("location", -0.0).with("temperature", 3.0))
            .unwrap();

        let at = |location: f64| {
            wrapper
                .get_data(&FilterKey::from(location))
                .and_then(|sample| sample.get_float("temperature"))
        };
        assert_eq!(at(1.5), Some(12.0));
        assert_eq!(at(2.5), Some(14.0));
        assert_eq!(at(0.0), Some(3.0));
        assert_eq!(at(3.5), None);
        assert_eq!(FilterKey::from(2.5).to_string(), "2.5");
    }

    #[test]
    fn test_array_value_is_rejected_on_update() {
        let wrapper = FilteredTopicWrapper::new(&handle(), "salIndex", None).unwrap();
        let sample = Sample::new().with("salIndex", Value::Array(vec![Value::Int(1)]));
        assert!(matches!(
            wrapper.update(&sample),
            Err(WatcherError::InvalidFilterField(_))
        ));
    }

    #[test]
    fn test_keys_are_isolated() {
        let wrapper = FilteredTopicWrapper::new(&handle(), "salIndex", None).unwrap();
        wrapper
            .update(&Sample::new().with("salIndex", 1i64).with("linePressure", 9500.0))
            .unwrap();
        wrapper
            .update(&Sample::new().with("salIndex", 2i64).with("linePressure", 100.0))
            .unwrap();
        wrapper
            .update(&Sample::new().with("salIndex", 2i64).with("linePressure", 200.0))
            .unwrap();

        let one = wrapper.get_data(&FilterKey::Int(1)).unwrap();
        let two = wrapper.get_data(&FilterKey::Int(2)).unwrap();
        assert_eq!(one.get_float("linePressure"), Some(9500.0));
        assert_eq!(two.get_float("linePressure"), Some(200.0));
        assert!(wrapper.get_data(&FilterKey::Int(3)).is_none());
    }

    #[test]
    fn test_default_for_unseen_key() {
        let default = Sample::new().with("linePressure", f64::NAN);
        let wrapper = FilteredTopicWrapper::new(&handle(), "salIndex", Some(default)).unwrap();
        let data = wrapper.get_data(&FilterKey::Int(7)).unwrap();
        assert!(data.get_float("linePressure").unwrap().is_nan());
    }

    #[test]
    fn test_update_without_filter_field() {
        let wrapper = FilteredTopicWrapper::new(&handle(), "salIndex", None).unwrap();
        assert!(matches!(
            wrapper.update(&Sample::new().with("linePressure", 1.0)),
            Err(WatcherError::MissingField { .. })
        ));
        assert!(wrapper.keys().is_empty());
    }
}
