// src/rules/mod.rs - Built-in rule classes
//
// Each submodule exposes a `class()` returning the RuleClass the registry
// stores: the class name, its config schema and a factory. Schemas list
// their defaults so the registry can fill them in before validation.

pub mod enabled;
pub mod heartbeat;
pub mod redundant_measurement;
pub mod test_rules;
pub mod threshold;

use crate::rule::RuleClass;

pub use enabled::Enabled;
pub use heartbeat::Heartbeat;
pub use redundant_measurement::RedundantMeasurement;
pub use threshold::{Threshold, ThresholdHandler};

/// Every rule class shipped with the crate
pub fn builtin_classes() -> Vec<RuleClass> {
    vec![
        // ====================================================================
        // SOURCE HEALTH
        // ====================================================================
        heartbeat::class(),
        enabled::class(),
        // ====================================================================
        // MEASUREMENTS
        // ====================================================================
        redundant_measurement::class(),
        threshold::class(),
        // ====================================================================
        // TEST RULES
        // ====================================================================
        test_rules::no_config_class(),
        test_rules::configured_severities_class(),
    ]
}
