// src/error.rs - Crate-wide error type
use thiserror::Error;

/// Application level error type used throughout the crate.
///
/// Variants fall in three groups: startup/configuration failures that abort
/// model construction, per-sample failures that a dispatch pass logs and
/// contains, and paging failures that the escalation worker retries.
#[derive(Error, Debug)]
pub enum WatcherError {
    /// I/O related failure
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or inconsistent configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error while parsing YAML configuration files
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Error while converting a rule config into its typed form
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// RemoteInfo descriptor rejected at construction
    #[error("Invalid remote info: {0}")]
    InvalidRemoteInfo(String),

    /// No rule class is registered under the requested name
    #[error("Unknown rule class '{classname}'. Available classes: {available}")]
    UnknownRule { classname: String, available: String },

    /// Two rules share a name, globally or on one topic
    #[error("Duplicate rule name: {0}")]
    DuplicateRule(String),

    /// A config mapping violates its schema
    #[error("Schema validation failed for {target}: {}", violations.join("; "))]
    Schema { target: String, violations: Vec<String> },

    /// Topic is not known to the bus or not subscribed by a wrapper
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    /// Filter field missing from the topic schema or not usable as a key
    #[error("Invalid filter field: {0}")]
    InvalidFilterField(String),

    /// Severity code or name outside the known set
    #[error("Invalid severity: {0}")]
    InvalidSeverity(String),

    /// Alarm name pattern that does not compile
    #[error("Invalid pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    /// A sample lacks a field the caller needs
    #[error("Field '{field}' missing from sample of {topic}")]
    MissingField { topic: String, field: String },

    /// Rule evaluation failed for one sample
    #[error("Rule '{rule}' failed: {message}")]
    Rule { rule: String, message: String },

    /// Paging collaborator reported a failure
    #[error("Paging error: {0}")]
    Paging(String),

    /// A bounded wait expired
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Convenient alias over [`Result`] using [`WatcherError`]
pub type Result<T> = std::result::Result<T, WatcherError>;
