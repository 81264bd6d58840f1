use proptest::prelude::*;
use std::collections::HashMap;
use watchkeeper::{Bus, FilterKey, FilteredTopicWrapper, LocalBus, Sample, TopicKey, TopicSchema, ValueType};

fn wrapper(default: Option<Sample>) -> FilteredTopicWrapper {
    let bus = LocalBus::new();
    bus.declare_topic(
        "ESS",
        "tel_temperature",
        TopicSchema::new()
            .field("sensorName", ValueType::String)
            .field("salIndex", ValueType::Int)
            .field("value", ValueType::Int),
    );
    let handle = bus.subscribe(&TopicKey::new("ESS", 0, "tel_temperature")).unwrap();
    FilteredTopicWrapper::new(&handle, "salIndex", default).unwrap()
}

proptest! {
    #[test]
    fn test_updates_are_isolated_per_key(
        updates in prop::collection::vec((0i64..6, any::<i64>()), 1..60),
    ) {
        let default = Sample::new().with("value", -1i64);
        let wrapper = wrapper(Some(default.clone()));
        let mut expected: HashMap<i64, Sample> = HashMap::new();

        for (key, value) in updates {
            let before: Vec<(i64, Option<Sample>)> = (0..6)
                .filter(|k| *k != key)
                .map(|k| (k, wrapper.get_data(&FilterKey::Int(k))))
                .collect();

            let sample = Sample::new().with("salIndex", key).with("value", value);
            wrapper.update(&sample).unwrap();
            expected.insert(key, sample.clone());

            prop_assert_eq!(wrapper.get_data(&FilterKey::Int(key)), Some(sample));
            for (other, previous) in before {
                prop_assert_eq!(wrapper.get_data(&FilterKey::Int(other)), previous);
            }
        }

        for key in 0..8 {
            let cached = wrapper.get_data(&FilterKey::Int(key));
            match expected.get(&key) {
                Some(sample) => prop_assert_eq!(cached, Some(sample.clone())),
                None => prop_assert_eq!(cached, Some(default.clone())),
            }
        }
        prop_assert_eq!(wrapper.keys().len(), expected.len());
    }

    #[test]
    fn test_unseen_key_without_default(seen in 0i64..100, unseen in 100i64..200) {
        let wrapper = wrapper(None);
        wrapper.update(&Sample::new().with("salIndex", seen)).unwrap();
        prop_assert!(wrapper.get_data(&FilterKey::Int(unseen)).is_none());
        prop_assert!(wrapper.get_data(&FilterKey::Int(seen)).is_some());
    }
}

#[test]
fn test_filter_field_must_be_scalar() {
    let bus = LocalBus::new();
    bus.declare_topic(
        "ESS",
        "tel_temperature",
        TopicSchema::new()
            .field("temperature", ValueType::Float)
            .field("samples", ValueType::Array),
    );
    let handle = bus.subscribe(&TopicKey::new("ESS", 0, "tel_temperature")).unwrap();
    assert!(FilteredTopicWrapper::new(&handle, "temperature", None).is_ok());
    assert!(FilteredTopicWrapper::new(&handle, "samples", None).is_err());
    assert!(FilteredTopicWrapper::new(&handle, "missing", None).is_err());
}
