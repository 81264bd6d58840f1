// src/remote_info.rs - Static description of one rule's subscription needs
use crate::error::{Result, WatcherError};
use crate::value::TopicKey;
use std::collections::HashSet;
use std::fmt;

/// Kind marker carried by every topic name prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    /// `evt_` topics
    Event,
    /// `tel_` topics
    Telemetry,
}

impl TopicKind {
    pub fn of(topic_name: &str) -> Option<Self> {
        if topic_name.len() > 4 && topic_name.starts_with("evt_") {
            Some(TopicKind::Event)
        } else if topic_name.len() > 4 && topic_name.starts_with("tel_") {
            Some(TopicKind::Telemetry)
        } else {
            None
        }
    }
}

/// Identity of one source instance: name plus index
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceKey {
    pub name: String,
    pub index: u32,
}

impl SourceKey {
    pub fn new(name: impl Into<String>, index: u32) -> Self {
        Self {
            name: name.into(),
            index,
        }
    }

    /// Parse `name` or `name:index`; a missing index means 0
    pub fn parse(name_index: &str) -> Result<Self> {
        let (name, index) = match name_index.split_once(':') {
            Some((name, index)) => {
                let index = index.trim().parse::<u32>().map_err(|_| {
                    WatcherError::InvalidRemoteInfo(format!(
                        "index in {:?} must be a non-negative integer",
                        name_index
                    ))
                })?;
                (name.trim(), index)
            }
            None => (name_index.trim(), 0),
        };
        if name.is_empty() {
            return Err(WatcherError::InvalidRemoteInfo(format!(
                "source name missing in {:?}",
                name_index
            )));
        }
        Ok(Self::new(name, index))
    }

    /// Attribute key used to find a RemoteWrapper from a rule
    pub fn attr_name(&self) -> String {
        format!("{}_{}", self.name.to_lowercase(), self.index)
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.index)
    }
}

/// Which topics of one source a rule needs, and how.
///
/// Callback topics trigger rule evaluation when they deliver; poll topics
/// are only read on demand. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteInfo {
    key: SourceKey,
    callback_names: Vec<String>,
    poll_names: Vec<String>,
}

impl RemoteInfo {
    /// Validate and build a descriptor.
    ///
    /// Fails if both name lists are empty, if any name repeats within or
    /// across the lists, or if a name lacks the `evt_`/`tel_` prefix.
    pub fn new<C, P, S>(
        source_name: impl Into<String>,
        source_index: u32,
        callback_names: C,
        poll_names: P,
    ) -> Result<Self>
    where
        C: IntoIterator<Item = S>,
        P: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let key = SourceKey::new(source_name, source_index);
        if key.name.trim().is_empty() {
            return Err(WatcherError::InvalidRemoteInfo(
                "source name must not be empty".to_string(),
            ));
        }
        let callback_names: Vec<String> = callback_names.into_iter().map(Into::into).collect();
        let poll_names: Vec<String> = poll_names.into_iter().map(Into::into).collect();
        if callback_names.is_empty() && poll_names.is_empty() {
            return Err(WatcherError::InvalidRemoteInfo(format!(
                "{}: callback_names and poll_names are both empty",
                key
            )));
        }

        let mut seen = HashSet::new();
        for name in callback_names.iter().chain(poll_names.iter()) {
            if !seen.insert(name.as_str()) {
                return Err(WatcherError::InvalidRemoteInfo(format!(
                    "{}: topic {} listed more than once",
                    key, name
                )));
            }
            if TopicKind::of(name).is_none() {
                return Err(WatcherError::InvalidRemoteInfo(format!(
                    "{}: topic {} must start with evt_ or tel_",
                    key, name
                )));
            }
        }

        Ok(Self {
            key,
            callback_names,
            poll_names,
        })
    }

    /// Build from a `name` or `name:index` string
    pub fn from_name_index<C, P, S>(name_index: &str, callback_names: C, poll_names: P) -> Result<Self>
    where
        C: IntoIterator<Item = S>,
        P: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let key = SourceKey::parse(name_index)?;
        Self::new(key.name, key.index, callback_names, poll_names)
    }

    pub fn source_name(&self) -> &str {
        &self.key.name
    }

    pub fn source_index(&self) -> u32 {
        self.key.index
    }

    pub fn key(&self) -> &SourceKey {
        &self.key
    }

    pub fn attr_name(&self) -> String {
        self.key.attr_name()
    }

    pub fn callback_names(&self) -> &[String] {
        &self.callback_names
    }

    pub fn poll_names(&self) -> &[String] {
        &self.poll_names
    }

    /// Callback names followed by poll names
    pub fn topic_names(&self) -> impl Iterator<Item = &str> {
        self.callback_names
            .iter()
            .chain(self.poll_names.iter())
            .map(String::as_str)
    }

    pub fn topic_key(&self, topic_name: &str) -> TopicKey {
        TopicKey::new(self.key.name.clone(), self.key.index, topic_name)
    }
}
