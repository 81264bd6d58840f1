use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use watchkeeper::*;

// ============================================================================
// FIXTURES
// ============================================================================

fn bus() -> LocalBus {
    let bus = LocalBus::new();
    bus.declare_topic("ATDome", "evt_heartbeat", TopicSchema::new());
    bus.declare_topic(
        "ATDome",
        "evt_summaryState",
        TopicSchema::new().field("summaryState", ValueType::Int),
    );
    bus.declare_topic(
        "ATDome",
        "tel_position",
        TopicSchema::new().field("azimuthPosition", ValueType::Float),
    );
    bus.declare_topic(
        "MTAirCompressor",
        "tel_analogData",
        TopicSchema::new()
            .field("salIndex", ValueType::Int)
            .field("linePressure", ValueType::Float),
    );
    bus.declare_topic(
        "ESS",
        "tel_temperature",
        TopicSchema::new().field("temperatureItem", ValueType::Array),
    );
    bus.declare_topic(
        "Test",
        "evt_scalars",
        TopicSchema::new().field("int0", ValueType::Int),
    );
    bus
}

fn build(yaml: &str, bus: &LocalBus, registry: &RuleRegistry) -> Result<Model> {
    let config = WatcherConfig::from_yaml(yaml)?;
    Model::new(&config, Arc::new(bus.clone()), registry, Arc::new(LogPager))
}

fn heartbeat() -> Sample {
    Sample::new()
}

fn summary_state(state: i64) -> Sample {
    Sample::new().with("summaryState", state)
}

// ============================================================================
// SCRIPTED RULE (registered by the tests, not a built-in)
// ============================================================================

#[derive(Deserialize)]
struct ScriptedConfig {
    name: String,
    mode: String,
}

/// Reports WARNING, returns an error, panics, or reads the poll topic
struct Scripted {
    base: RuleBase,
    mode: String,
}

impl Rule for Scripted {
    fn base(&self) -> &RuleBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut RuleBase {
        &mut self.base
    }

    fn compute_alarm_severity(
        &mut self,
        data: &Sample,
        _topic_callback: &TopicCallback,
    ) -> Result<SeverityUpdate> {
        match self.mode.as_str() {
            "warn" => Ok(SeverityUpdate::changed(
                Severity::Warning,
                format!("int0={}", data.get_int("int0").unwrap_or_default()),
            )),
            "fail" => Err(self.base.error("scripted failure")),
            "panic" => panic!("scripted panic"),
            _ => {
                let position = self.base.remote("atdome_0")?.get("tel_position")?;
                Ok(match position {
                    None => SeverityUpdate::changed(Severity::Serious, "no position yet"),
                    Some(_) => SeverityUpdate::nominal(),
                })
            }
        }
    }
}

fn scripted_class() -> RuleClass {
    fn schema() -> Option<serde_json::Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "mode": {"enum": ["warn", "fail", "panic", "poll"]}
            },
            "required": ["name", "mode"],
            "additionalProperties": false
        }))
    }

    fn build(config: serde_json::Value) -> Result<Box<dyn Rule>> {
        let config: ScriptedConfig = watchkeeper::rule::parse_config("test.Scripted", config)?;
        let mut infos = vec![RemoteInfo::new("Test", 0, ["evt_scalars"], Vec::<&str>::new())?];
        if config.mode == "poll" {
            infos.push(RemoteInfo::new("ATDome", 0, Vec::<&str>::new(), ["tel_position"])?);
        }
        Ok(Box::new(Scripted {
            base: RuleBase::new(format!("test.Scripted.{}", config.name), infos),
            mode: config.mode,
        }))
    }

    RuleClass {
        name: "test.Scripted",
        schema,
        build,
    }
}

fn registry_with_scripted() -> RuleRegistry {
    let mut registry = RuleRegistry::builtin();
    registry.register(scripted_class()).unwrap();
    registry
}

const SCRIPTED: &str = r#"
rules:
  - classname: test.Scripted
    configs:
      - {name: a, mode: warn}
      - {name: b, mode: fail}
      - {name: c, mode: panic}
      - {name: d, mode: warn}
"#;

// ============================================================================
// DISPATCH
// ============================================================================

#[tokio::test]
async fn test_every_rule_runs_despite_failures() {
    let bus = bus();
    let mut model = build(SCRIPTED, &bus, &registry_with_scripted()).unwrap();
    model.enable();

    let key = TopicKey::new("Test", 0, "evt_scalars");
    let report = model.dispatch(&key, &Sample::new().with("int0", 5i64)).unwrap();
    assert_eq!(report.invoked, 4);
    assert_eq!(report.failed, 2);
    assert_eq!(report.changed, 2);

    for name in ["test.Scripted.a", "test.Scripted.d"] {
        let alarm = model.alarm(name).unwrap();
        assert_eq!(alarm.severity(), Severity::Warning);
        assert_eq!(alarm.reason(), "int0=5");
    }
    for name in ["test.Scripted.b", "test.Scripted.c"] {
        assert!(model.alarm(name).unwrap().nominal());
    }

    // Failing rules stay registered and run again on the next delivery
    let report = model.dispatch(&key, &Sample::new().with("int0", 6i64)).unwrap();
    assert_eq!(report.invoked, 4);
    assert_eq!(report.changed, 2);
    assert_eq!(model.stats().rule_failures, 4);
}

#[tokio::test]
async fn test_disabled_model_then_one_sample() {
    let bus = bus();
    let mut model = build(SCRIPTED, &bus, &registry_with_scripted()).unwrap();
    let key = TopicKey::new("Test", 0, "evt_scalars");

    for i in 0..5 {
        bus.publish(&key, Sample::new().with("int0", i as i64)).unwrap();
    }
    assert_eq!(model.process_pending(), 5);
    assert!(model.alarms().all(|alarm| alarm.nominal()));

    model.enable();
    assert_eq!(model.process_pending(), 0);
    assert!(model.alarms().all(|alarm| alarm.nominal()));

    bus.publish(&key, Sample::new().with("int0", 9i64)).unwrap();
    assert_eq!(model.process_pending(), 1);
    assert_eq!(model.alarm("test.Scripted.a").unwrap().reason(), "int0=9");
    assert_eq!(model.alarm("test.Scripted.a").unwrap().max_severity(), Severity::Warning);
}

#[tokio::test]
async fn test_poll_topic_read_on_demand() {
    let bus = bus();
    let yaml = "rules:\n  - classname: test.Scripted\n    configs:\n      - {name: p, mode: poll}\n";
    let mut model = build(yaml, &bus, &registry_with_scripted()).unwrap();
    model.enable();

    let position = TopicKey::new("ATDome", 0, "tel_position");
    assert!(model.topic_callback(&position).is_none());
    assert!(!bus.has_callback(&position));

    let scalars = TopicKey::new("Test", 0, "evt_scalars");
    model.dispatch(&scalars, &Sample::new());
    assert_eq!(model.alarm("test.Scripted.p").unwrap().severity(), Severity::Serious);

    bus.publish(&position, Sample::new().with("azimuthPosition", 90.0)).unwrap();
    assert_eq!(model.process_pending(), 0);
    model.dispatch(&scalars, &Sample::new());
    assert!(model.alarm("test.Scripted.p").unwrap().nominal());
}

// ============================================================================
// BUILT-IN RULE SCENARIOS
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_heartbeat_times_out_once() {
    let bus = bus();
    let yaml = "rules:\n  - classname: Heartbeat\n    configs:\n      - {name: ATDome, timeout: 0.5}\n";
    let mut model = build(yaml, &bus, &RuleRegistry::builtin()).unwrap();
    let alarm = model.alarm("Heartbeat.ATDome:0").unwrap().clone();
    let mut queue = alarm.init_severity_queue(16);
    let key = TopicKey::new("ATDome", 0, "evt_heartbeat");

    model.enable();
    bus.publish(&key, heartbeat()).unwrap();
    model.process_pending();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(alarm.nominal());
    bus.publish(&key, heartbeat()).unwrap();
    model.process_pending();

    assert_eq!(
        queue.next_severity(Duration::from_secs(1)).await.unwrap(),
        Severity::Serious
    );
    assert_eq!(alarm.reason(), "Heartbeat event not seen in 0.5 seconds");
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(queue.is_empty());

    bus.publish(&key, heartbeat()).unwrap();
    model.process_pending();
    assert_eq!(queue.try_next(), Some(Severity::None));
    assert!(alarm.nominal());
    model.close();
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_paused_while_disabled() {
    let bus = bus();
    let yaml = "rules:\n  - classname: Heartbeat\n    configs:\n      - {name: ATDome, timeout: 0.5}\n";
    let model = build(yaml, &bus, &RuleRegistry::builtin()).unwrap();
    model.enable();
    model.disable();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(model.alarm("Heartbeat.ATDome:0").unwrap().nominal());
}

#[tokio::test]
async fn test_redundant_pair() {
    let bus = bus();
    let yaml = r#"
rules:
  - classname: RedundantMeasurement
    configs:
      - source: MTAirCompressor
        topic: tel_analogData
        field: linePressure
"#;
    let mut model = build(yaml, &bus, &RuleRegistry::builtin()).unwrap();
    model.enable();
    let key = TopicKey::new("MTAirCompressor", 0, "tel_analogData");
    let alarm = model
        .alarm("RedundantMeasurement.MTAirCompressor:0.linePressure")
        .unwrap()
        .clone();
    let mut publish = |index: i64, pressure: f64| {
        bus.publish(
            &key,
            Sample::new().with("salIndex", index).with("linePressure", pressure),
        )
        .unwrap();
        model.process_pending();
        alarm.severity()
    };

    assert_eq!(publish(1, 9500.0), Severity::Warning);
    assert_eq!(publish(2, 9700.0), Severity::None);
    assert_eq!(publish(1, 9400.0), Severity::None);
    assert_eq!(publish(2, f64::NAN), Severity::Warning);
    assert_eq!(publish(1, 9000.0), Severity::Critical);
    assert_eq!(publish(2, 9100.0), Severity::Warning);
    assert_eq!(publish(1, 9001.0), Severity::None);
}

#[tokio::test]
async fn test_enabled_tracks_summary_state() {
    let bus = bus();
    let yaml = "rules:\n  - classname: Enabled\n    configs:\n      - {name: ATDome, standby_severity: 2}\n";
    let mut model = build(yaml, &bus, &RuleRegistry::builtin()).unwrap();
    model.enable();
    let key = TopicKey::new("ATDome", 0, "evt_summaryState");
    let alarm = model.alarm("Enabled.ATDome:0").unwrap().clone();

    for (state, severity) in [
        (5, Severity::Warning),
        (3, Severity::Critical),
        (4, Severity::Serious),
        (2, Severity::None),
    ] {
        bus.publish(&key, summary_state(state)).unwrap();
        model.process_pending();
        assert_eq!(alarm.severity(), severity, "state {}", state);
    }
}

#[tokio::test(start_paused = true)]
async fn test_threshold_polls_while_enabled() {
    let bus = bus();
    let yaml = r#"
rules:
  - classname: Threshold
    configs:
      - name: ESS:1
        topic: tel_temperature
        field: temperatureItem
        poll_interval: 1
        max_data_age: 30
        warning_level: 25
        critical_level: 40
        hysteresis: 2
        units: C
"#;
    let model = build(yaml, &bus, &RuleRegistry::builtin()).unwrap();
    let key = TopicKey::new("ESS", 1, "tel_temperature");
    assert!(model.topic_callback(&key).is_none());
    assert!(model.remote(&SourceKey::new("ESS", 1)).unwrap().handle("tel_temperature").is_some());

    let alarm = model.alarm("Threshold.ESS:1.temperatureItem").unwrap().clone();
    let publish = |readings: &[f64]| {
        let values = readings.iter().map(|&v| Value::Float(v)).collect();
        bus.publish(&key, Sample::new().with("temperatureItem", Value::Array(values)))
            .unwrap();
    };

    // Not polled until enabled
    publish(&[41.0]);
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(alarm.nominal());

    model.enable();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(alarm.severity(), Severity::Critical);
    assert_eq!(alarm.reason(), "temperatureItem 41.00 C > 40.00");

    publish(&[20.0, 39.0]);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(alarm.severity(), Severity::Critical);
    assert!(alarm.reason().ends_with("- hysteresis 2.00"));

    publish(&[20.0, 37.0]);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(alarm.severity(), Severity::Warning);

    model.disable();
    publish(&[10.0]);
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(alarm.severity(), Severity::Warning);
}

// ============================================================================
// STARTUP FAILURES
// ============================================================================

#[tokio::test]
async fn test_startup_failures_are_fatal() {
    let bus = bus();
    let registry = registry_with_scripted();

    let unknown = "rules:\n  - classname: Missing\n    configs: [{}]\n";
    match build(unknown, &bus, &registry) {
        Err(WatcherError::UnknownRule { available, .. }) => assert!(available.contains("test.Scripted")),
        Err(other) => panic!("unexpected error {}", other),
        Ok(_) => panic!("model built with an unknown rule class"),
    }

    let duplicate = "rules:\n  - classname: test.Scripted\n    configs:\n      - {name: a, mode: warn}\n      - {name: a, mode: fail}\n";
    assert!(matches!(build(duplicate, &bus, &registry), Err(WatcherError::DuplicateRule(_))));

    let invalid = "rules:\n  - classname: test.Scripted\n    configs:\n      - {name: a, mode: loud}\n";
    assert!(matches!(build(invalid, &bus, &registry), Err(WatcherError::Schema { .. })));

    let bad_source = "rules:\n  - classname: Heartbeat\n    configs:\n      - {name: \"ATDome:x\"}\n";
    assert!(matches!(build(bad_source, &bus, &registry), Err(WatcherError::InvalidRemoteInfo(_))));

    assert!(!bus.has_callback(&TopicKey::new("Test", 0, "evt_scalars")));
    assert!(!bus.has_callback(&TopicKey::new("ATDome", 0, "evt_heartbeat")));
}

#[test]
fn test_model_needs_runtime() {
    let bus = bus();
    assert!(matches!(
        build("rules: []\n", &bus, &RuleRegistry::builtin()),
        Err(WatcherError::Config(_))
    ));
}
