use proptest::prelude::*;
use watchkeeper::{RemoteInfo, SourceKey, TopicKind, WatcherError};

/// Distinct, correctly prefixed topic names split into callback and poll lists
fn split_names() -> impl Strategy<Value = (Vec<String>, Vec<String>)> {
    prop::collection::btree_set("(evt|tel)_[a-zA-Z][a-zA-Z0-9]{0,11}", 1..12)
        .prop_map(|names| names.into_iter().collect::<Vec<String>>())
        .prop_shuffle()
        .prop_flat_map(|names| {
            let len = names.len();
            (Just(names), 0..=len)
        })
        .prop_map(|(names, split)| {
            let (callbacks, polls) = names.split_at(split);
            (callbacks.to_vec(), polls.to_vec())
        })
}

proptest! {
    #[test]
    fn test_topic_names_are_callbacks_then_polls(
        (callbacks, polls) in split_names(),
        index in 0u32..100,
    ) {
        let info = RemoteInfo::new("Source", index, callbacks.clone(), polls.clone()).unwrap();
        let expected: Vec<&str> = callbacks.iter().chain(polls.iter()).map(String::as_str).collect();
        prop_assert_eq!(info.topic_names().collect::<Vec<_>>(), expected);
        prop_assert_eq!(info.callback_names(), callbacks.as_slice());
        prop_assert_eq!(info.poll_names(), polls.as_slice());
        for name in info.topic_names() {
            prop_assert!(TopicKind::of(name).is_some());
        }
    }

    #[test]
    fn test_name_shared_by_both_lists_is_rejected(
        (callbacks, polls) in split_names().prop_filter("need a callback", |(c, _)| !c.is_empty()),
        pick in any::<prop::sample::Index>(),
    ) {
        let shared = pick.get(&callbacks).clone();
        let mut polls = polls;
        polls.push(shared);
        let result = RemoteInfo::new("Source", 0, callbacks, polls);
        prop_assert!(matches!(result, Err(WatcherError::InvalidRemoteInfo(_))));
    }

    #[test]
    fn test_unmarked_name_is_rejected(
        (callbacks, polls) in split_names(),
        bad in "[a-df-su-z][a-z_]{0,10}",
    ) {
        let mut callbacks = callbacks;
        callbacks.push(bad);
        let result = RemoteInfo::new("Source", 0, callbacks, polls);
        prop_assert!(matches!(result, Err(WatcherError::InvalidRemoteInfo(_))));
    }

    #[test]
    fn test_source_key_parses_its_display(name in "[A-Za-z][A-Za-z0-9]{0,15}", index in any::<u32>()) {
        let key = SourceKey::new(name.clone(), index);
        prop_assert_eq!(SourceKey::parse(&key.to_string()).unwrap(), key.clone());
        prop_assert_eq!(key.attr_name(), format!("{}_{}", name.to_lowercase(), index));
        if index == 0 {
            prop_assert_eq!(SourceKey::parse(&name).unwrap(), key);
        }
    }
}

#[test]
fn test_empty_lists_are_rejected() {
    let result = RemoteInfo::new("Source", 0, Vec::<String>::new(), Vec::<String>::new());
    assert!(matches!(result, Err(WatcherError::InvalidRemoteInfo(_))));
}
