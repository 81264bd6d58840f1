// src/config_schema.rs - JSON schema validation for rule configs and documents
use crate::error::{Result, WatcherError};
use jsonschema::JSONSchema;
use serde_json::{json, Map, Value};
use tracing::debug;

/// Validate a rule's raw config against its declared schema.
///
/// Top-level `default`s from the schema's `properties` are filled in before
/// validation, so `required` may list defaulted fields. Returns the
/// defaulted config, or every violated constraint.
pub fn validate_rule_config(target: &str, schema: &Value, raw: &Value) -> Result<Value> {
    let config = apply_defaults(schema, raw)?;
    validate(target, schema, &config)?;
    debug!("Validated config for {}", target);
    Ok(config)
}

/// Validate `instance` against `schema`, collecting all violations
pub fn validate(target: &str, schema: &Value, instance: &Value) -> Result<()> {
    let compiled = JSONSchema::compile(schema).map_err(|e| WatcherError::Schema {
        target: target.to_string(),
        violations: vec![format!("schema does not compile: {}", e)],
    })?;
    let result = compiled.validate(instance);
    if let Err(errors) = result {
        let violations: Vec<String> = errors.map(|error| error.to_string()).collect();
        return Err(WatcherError::Schema {
            target: target.to_string(),
            violations,
        });
    }
    Ok(())
}

fn apply_defaults(schema: &Value, raw: &Value) -> Result<Value> {
    let mut config = match raw {
        Value::Null => Map::new(),
        Value::Object(map) => map.clone(),
        // Let the schema report the type mismatch
        other => return Ok(other.clone()),
    };
    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (name, property) in properties {
            if config.contains_key(name) {
                continue;
            }
            if let Some(default) = property.get("default") {
                config.insert(name.clone(), default.clone());
            }
        }
    }
    Ok(Value::Object(config))
}

/// Schema of the top-level watcher configuration document
pub fn watcher_config_schema() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "description": "Configuration for the alarm watcher",
        "type": "object",
        "properties": {
            "disabled_sources": {
                "description": "Sources to skip, as name or name:index",
                "type": "array",
                "items": {"type": "string"}
            },
            "auto_acknowledge_delay": {
                "description": "Delay (sec) before an unacknowledged active alarm is acknowledged automatically; 0 to disable",
                "type": "number",
                "minimum": 0
            },
            "auto_unacknowledge_delay": {
                "description": "Delay (sec) after an alarm returns to NONE before its acknowledgment is reset; 0 to reset at once",
                "type": "number",
                "minimum": 0
            },
            "rules": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "classname": {"type": "string", "minLength": 1},
                        "configs": {"type": "array"}
                    },
                    "required": ["classname", "configs"],
                    "additionalProperties": false
                }
            },
            "escalation": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "alarms": {"type": "array", "items": {"type": "string"}},
                        "alarm_name_pattern": {"type": "string"},
                        "responder": {"type": "string"},
                        "delay": {"type": "number"},
                        "severity": {"type": ["string", "integer"]},
                        "resolve_on": {"enum": ["nominal", "acknowledged"]}
                    },
                    "required": ["responder", "delay"],
                    "additionalProperties": false
                }
            },
            "escalation_timeout": {"type": "number", "exclusiveMinimum": 0},
            "escalation_retry": {"type": "object"}
        },
        "required": ["rules"],
        "additionalProperties": false
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat_schema() -> Value {
        json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "timeout": {"type": "number", "default": 3}
            },
            "required": ["name", "timeout"],
            "additionalProperties": false
        })
    }

    #[test]
    fn test_defaults_are_applied() {
        let config = validate_rule_config("Heartbeat", &heartbeat_schema(), &json!({"name": "ATDome"})).unwrap();
        assert_eq!(config["timeout"], json!(3));
        assert_eq!(config["name"], json!("ATDome"));
    }

    #[test]
    fn test_explicit_values_win() {
        let config = validate_rule_config(
            "Heartbeat",
            &heartbeat_schema(),
            &json!({"name": "ATDome", "timeout": 0.5}),
        )
        .unwrap();
        assert_eq!(config["timeout"], json!(0.5));
    }

    #[test]
    fn test_all_violations_are_reported() {
        let err = validate_rule_config(
            "Heartbeat",
            &heartbeat_schema(),
            &json!({"timeout": "soon", "extra": true}),
        )
        .unwrap_err();
        match err {
            WatcherError::Schema { target, violations } => {
                assert_eq!(target, "Heartbeat");
                assert!(violations.len() >= 3, "{:?}", violations);
            }
            other => panic!("unexpected error {}", other),
        }
    }

    #[test]
    fn test_non_object_config() {
        assert!(validate_rule_config("Heartbeat", &heartbeat_schema(), &json!([1, 2])).is_err());
    }

    #[test]
    fn test_document_schema() {
        let schema = watcher_config_schema();
        assert!(validate("document", &schema, &json!({"rules": []})).is_ok());
        assert!(validate("document", &schema, &json!({"rules": [], "auto_acknowledge_delay": -1})).is_err());
        assert!(validate("document", &schema, &json!({"rulez": []})).is_err());
    }
}
