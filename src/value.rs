// src/value.rs - Sample values, topic schemas and topic identities
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One field value carried by a bus sample
///
/// # Examples
///
/// ```rust
/// use watchkeeper::Value;
///
/// assert_eq!(Value::Int(3).as_float(), Some(3.0));
/// assert_eq!(Value::Bool(true).as_int(), Some(1));
/// assert!(Value::Float(f64::NAN).as_float().unwrap().is_nan());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    /// Boolean value
    Bool(bool),
    /// Integer value (64-bit)
    Int(i64),
    /// Floating-point value (64-bit)
    Float(f64),
    /// String value
    String(String),
    /// Array of values
    Array(Vec<Value>),
}

/// Value type enumeration used by topic schemas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Bool,
    Int,
    Float,
    String,
    Array,
}

impl ValueType {
    /// True for every type except arrays
    pub fn is_scalar(self) -> bool {
        !matches!(self, ValueType::Array)
    }
}

impl Value {
    /// Convert to integer if possible
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Float(f) => {
                if f.is_finite() && *f >= i64::MIN as f64 && *f <= i64::MAX as f64 {
                    Some(*f as i64)
                } else {
                    None
                }
            }
            Value::String(s) => s.parse().ok(),
            Value::Array(_) => None,
        }
    }

    /// Convert to float if possible
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::String(s) => s.parse().ok(),
            Value::Array(_) => None,
        }
    }

    /// Get the ValueType for this value
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Bool(_) => ValueType::Bool,
            Value::Int(_) => ValueType::Int,
            Value::Float(_) => ValueType::Float,
            Value::String(_) => ValueType::String,
            Value::Array(_) => ValueType::Array,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::String(s) => write!(f, "{}", s),
            Value::Array(items) => {
                let items: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", items.join(", "))
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

// ============================================================================
// SAMPLES
// ============================================================================

/// One structured record delivered on a topic, addressed by field name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    fields: BTreeMap<String, Value>,
}

impl Sample {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field insertion
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Numeric field as f64, if present and convertible
    pub fn get_float(&self, field: &str) -> Option<f64> {
        self.get(field).and_then(Value::as_float)
    }

    pub fn get_int(&self, field: &str) -> Option<i64> {
        self.get(field).and_then(Value::as_int)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let items: Vec<String> = self
            .fields
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        write!(f, "{{{}}}", items.join(", "))
    }
}

/// Field layout of the samples a topic carries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopicSchema {
    fields: BTreeMap<String, ValueType>,
}

impl TopicSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field declaration
    pub fn field(mut self, name: impl Into<String>, value_type: ValueType) -> Self {
        self.fields.insert(name.into(), value_type);
        self
    }

    pub fn field_type(&self, name: &str) -> Option<ValueType> {
        self.fields.get(name).copied()
    }
}

// ============================================================================
// TOPIC IDENTITY
// ============================================================================

/// Fully qualified topic: source name, source index and topic name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicKey {
    pub source: String,
    pub index: u32,
    pub name: String,
}

impl TopicKey {
    pub fn new(source: impl Into<String>, index: u32, name: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            index,
            name: name.into(),
        }
    }
}

impl fmt::Display for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.source, self.index, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::Bool(true).as_int(), Some(1));
        assert_eq!(Value::Int(0).value_type(), ValueType::Int);
        assert_eq!(Value::Float(42.0).as_int(), Some(42));
        assert_eq!(Value::Float(f64::INFINITY).as_int(), None);
        assert_eq!(Value::from("12.5").as_float(), Some(12.5));
        assert_eq!(Value::Array(vec![]).as_float(), None);
    }

    #[test]
    fn test_scalar_types() {
        assert!(ValueType::Int.is_scalar());
        assert!(ValueType::String.is_scalar());
        assert!(!ValueType::Array.is_scalar());
    }

    #[test]
    fn test_sample_access() {
        let sample = Sample::new().with("salIndex", 2i64).with("linePressure", 9100.0);
        assert_eq!(sample.get_int("salIndex"), Some(2));
        assert_eq!(sample.get_float("linePressure"), Some(9100.0));
        assert!(sample.get("missing").is_none());
        assert_eq!(sample.to_string(), "{linePressure=9100, salIndex=2}");
    }

    #[test]
    fn test_topic_key_display() {
        let key = TopicKey::new("ATDome", 0, "evt_heartbeat");
        assert_eq!(key.to_string(), "ATDome:0/evt_heartbeat");
    }
}
