//! Reconciler hot paths: the per-frame interpolated read and the outbound diff.
//!
//! ```bash
//! cargo bench --bench interpolation
//! ```

use std::sync::Arc;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

use rune_sync::{
    sync::{EntityDelta, ReconcilerConfig},
    EntityId, EntityState, ManualClock, StatePayload, StateReconciler, Vec3,
};

fn filled_reconciler(entities: usize) -> (StateReconciler, Vec<EntityId>) {
    let clock = ManualClock::new(0);
    let mut reconciler = StateReconciler::new(ReconcilerConfig::default(), Arc::new(clock));
    let ids: Vec<EntityId> = (0..entities).map(|i| EntityId::new(format!("p{}", i))).collect();

    for id in &ids {
        for step in 0..32u64 {
            let state = EntityState::at(Vec3::new(step as f32, 0.0, 0.0), step as f32 * 0.1);
            reconciler.receive_remote_state(id, &StatePayload::Full(state), step * 50);
        }
    }
    (reconciler, ids)
}

fn bench_interpolated_read(c: &mut Criterion) {
    let (reconciler, ids) = filled_reconciler(64);

    c.bench_function("interpolated_read/64_entities", |b| {
        b.iter(|| {
            for id in &ids {
                black_box(reconciler.get_interpolated_state(id, black_box(1_025)));
            }
        })
    });
}

fn bench_receive_delta(c: &mut Criterion) {
    let (mut reconciler, ids) = filled_reconciler(1);
    let id = &ids[0];
    let delta = StatePayload::Delta(EntityDelta {
        position: Some(Vec3::new(1.0, 2.0, 3.0)),
        ..EntityDelta::default()
    });
    let mut ts = 2_000u64;

    c.bench_function("receive_remote_state/delta", |b| {
        b.iter(|| {
            ts += 1;
            black_box(reconciler.receive_remote_state(id, &delta, ts));
        })
    });
}

fn bench_diff(c: &mut Criterion) {
    let a = EntityState::at(Vec3::new(0.0, 0.0, 0.0), 0.0);
    let mut b = EntityState::at(Vec3::new(1.0, 0.0, 0.0), 0.2);
    b.grounded = true;

    c.bench_function("entity_state/diff", |bench| {
        bench.iter(|| black_box(black_box(&b).diff(black_box(&a))))
    });
}

criterion_group!(benches, bench_interpolated_read, bench_receive_delta, bench_diff);
criterion_main!(benches);
