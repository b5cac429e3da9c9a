use std::sync::Arc;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use serde::{Deserialize, Serialize};
use serde_json::json;

use eventum_core::{EventPayload, EventSourced, PendingEvents, SourceKey, VersionedBatch, replay};
use eventum_infra::{EventStore, InMemoryEventStore, PartitionedRouter};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum CounterEvent {
    Incremented { by: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Counter {
    id: String,
    version: u64,
    total: u64,
    pending: PendingEvents<CounterEvent>,
}

impl EventSourced for Counter {
    type Event = CounterEvent;
    const NAMESPACE: &'static str = "bench";
    const TYPE_NAME: &'static str = "Counter";
    const QUALIFIER: &'static str = "eventum";

    fn with_id(source_id: &str) -> Self {
        Self {
            id: source_id.to_string(),
            version: 0,
            total: 0,
            pending: PendingEvents::new(),
        }
    }

    fn source_id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    fn apply(&mut self, event: &Self::Event) {
        let CounterEvent::Incremented { by } = event;
        self.total += by;
    }

    fn event_type_name(event: &Self::Event) -> &'static str {
        let CounterEvent::Incremented { .. } = event;
        "Incremented"
    }

    fn pending(&self) -> &PendingEvents<Self::Event> {
        &self.pending
    }

    fn pending_mut(&mut self) -> &mut PendingEvents<Self::Event> {
        &mut self.pending
    }
}

fn key(id: &str) -> SourceKey {
    SourceKey::new("bench", "Counter", "eventum", id)
}

fn batch(id: &str, start: u64) -> VersionedBatch {
    VersionedBatch::new(
        key(id),
        None,
        start,
        vec![EventPayload {
            order: 0,
            qualifier: "eventum".to_string(),
            namespace: "bench".to_string(),
            type_name: "Incremented".to_string(),
            body: json!({ "Incremented": { "by": 1 } }),
        }],
    )
    .unwrap()
}

fn bench_append(c: &mut Criterion) {
    c.bench_function("event_store_append_100", |b| {
        b.iter(|| {
            let store = InMemoryEventStore::new();
            for version in 1..=100u64 {
                store.append(batch("counter", version)).unwrap();
            }
            black_box(store)
        })
    });
}

fn bench_replay(c: &mut Criterion) {
    let store = Arc::new(InMemoryEventStore::new());
    for version in 1..=1000u64 {
        store.append(batch("counter", version)).unwrap();
    }
    let batches = store.find_since(&key("counter"), 0).unwrap();

    c.bench_function("replay_1000_events", |b| {
        b.iter(|| {
            let mut counter = Counter::with_id("counter");
            replay(&mut counter, black_box(&batches)).unwrap();
            black_box(counter.total)
        })
    });
}

fn bench_partitioning(c: &mut Criterion) {
    let router: PartitionedRouter<u64> = PartitionedRouter::new(8, None);
    c.bench_function("partition_for_key", |b| {
        b.iter(|| black_box(router.partition_for(black_box("order-1234567890"))))
    });
}

criterion_group!(benches, bench_append, bench_replay, bench_partitioning);
criterion_main!(benches);
