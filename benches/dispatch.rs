//! Sample dispatch benchmarks

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use watchkeeper::{LocalBus, LogPager, Model, RuleRegistry, Sample, TopicKey, TopicSchema, ValueType, WatcherConfig};

fn create_test_config(num_sources: usize) -> WatcherConfig {
    let mut yaml = String::from("auto_acknowledge_delay: 0\nrules:\n  - classname: Enabled\n    configs:\n");
    for i in 0..num_sources {
        yaml.push_str(&format!("      - name: \"ATDome:{}\"\n", i));
    }
    WatcherConfig::from_yaml(&yaml).expect("Failed to parse config")
}

fn create_bus() -> LocalBus {
    let bus = LocalBus::new();
    bus.declare_topic(
        "ATDome",
        "evt_summaryState",
        TopicSchema::new().field("summaryState", ValueType::Int),
    );
    bus
}

fn benchmark_dispatch(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("Failed to build runtime");
    let _guard = runtime.enter();

    let mut group = c.benchmark_group("dispatch");
    for source_count in [10, 50, 100, 500].iter() {
        group.bench_function(format!("{}_sources", source_count), |b| {
            let bus = create_bus();
            let mut model = Model::new(
                &create_test_config(*source_count),
                Arc::new(bus),
                &RuleRegistry::builtin(),
                Arc::new(LogPager),
            )
            .expect("Failed to create model");
            model.enable();

            let keys: Vec<TopicKey> = (0..*source_count)
                .map(|i| TopicKey::new("ATDome", i as u32, "evt_summaryState"))
                .collect();
            let fault = Sample::new().with("summaryState", 3i64);
            let enabled = Sample::new().with("summaryState", 2i64);

            b.iter(|| {
                for key in &keys {
                    black_box(model.dispatch(key, &fault));
                    black_box(model.dispatch(key, &enabled));
                }
            });
        });
    }
    group.finish();
}

fn benchmark_publish_and_drain(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("Failed to build runtime");
    let _guard = runtime.enter();

    c.bench_function("publish_and_drain_100", |b| {
        let bus = create_bus();
        let mut model = Model::new(
            &create_test_config(100),
            Arc::new(bus.clone()),
            &RuleRegistry::builtin(),
            Arc::new(LogPager),
        )
        .expect("Failed to create model");
        model.enable();
        let keys: Vec<TopicKey> = (0..100)
            .map(|i| TopicKey::new("ATDome", i, "evt_summaryState"))
            .collect();

        let mut state = 2i64;
        b.iter(|| {
            state = if state == 2 { 3 } else { 2 };
            for key in &keys {
                bus.publish(key, Sample::new().with("summaryState", state))
                    .expect("publish failed");
            }
            black_box(model.process_pending());
        });
    });
}

criterion_group!(benches, benchmark_dispatch, benchmark_publish_and_drain);
criterion_main!(benches);
