//! Benchmarks for the core structural operations.
//!
//! Run with: cargo bench
//!
//! Measures entity spawning, archetype migration and chunk-level query
//! iteration.

use std::sync::Arc;

use chunked_ecs::prelude::*;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

#[derive(Debug, Copy, Clone)]
struct Position {
    x: f32,
    y: f32,
    z: f32,
}

#[derive(Debug, Copy, Clone)]
struct Velocity {
    x: f32,
    y: f32,
    z: f32,
}

#[derive(Debug, Copy, Clone)]
struct Health(u32);

fn metadata() -> Arc<ArchetypeMetadata> {
    let mut builder = ComponentTypeTable::builder();
    builder.register::<Position>();
    builder.register::<Velocity>();
    builder.register::<Health>();
    ArchetypeMetadata::new(EcsConfig::default(), builder.build()).unwrap()
}

fn bench_spawn(c: &mut Criterion) {
    let mut group = c.benchmark_group("spawn");

    group.bench_function("spawn_1k_single_component", |b| {
        let metadata = metadata();
        b.iter(|| {
            let world = World::new(Arc::clone(&metadata));
            for i in 0..1_000 {
                let e = world.spawn().unwrap();
                world
                    .add_component(
                        e,
                        Position {
                            x: i as f32,
                            y: 0.0,
                            z: 0.0,
                        },
                    )
                    .unwrap();
            }
            black_box(world.entity_count())
        });
    });

    group.bench_function("create_entity_1k_builder_two_components", |b| {
        let metadata = metadata();
        b.iter(|| {
            let world = World::new(Arc::clone(&metadata));
            let table = Arc::clone(world.metadata().table());
            for i in 0..1_000 {
                let builder = EntityBuilder::new(Arc::clone(&table))
                    .with(Position {
                        x: i as f32,
                        y: 0.0,
                        z: 0.0,
                    })
                    .unwrap()
                    .with(Velocity {
                        x: 1.0,
                        y: 0.0,
                        z: 0.0,
                    })
                    .unwrap();
                world.create_entity(&builder).unwrap();
            }
            black_box(world.entity_count())
        });
    });

    group.finish();
}

fn bench_migration(c: &mut Criterion) {
    let mut group = c.benchmark_group("migration");

    group.bench_function("add_remove_component_1k", |b| {
        let metadata = metadata();
        let world = World::new(Arc::clone(&metadata));
        let entities: Vec<Entity> = (0..1_000)
            .map(|i| {
                let e = world.spawn().unwrap();
                world
                    .add_component(
                        e,
                        Position {
                            x: i as f32,
                            y: 0.0,
                            z: 0.0,
                        },
                    )
                    .unwrap();
                e
            })
            .collect();

        b.iter(|| {
            for &e in &entities {
                world
                    .add_component(e, Velocity { x: 1.0, y: 0.0, z: 0.0 })
                    .unwrap();
                world.remove_component::<Velocity>(e).unwrap();
            }
        });
    });

    group.finish();
}

fn bench_query_iteration(c: &mut Criterion) {
    let mut group = c.benchmark_group("query");

    let metadata = metadata();
    let world = World::new(metadata);
    for i in 0..10_000u32 {
        let e = world.spawn().unwrap();
        world
            .add_component(
                e,
                Position {
                    x: i as f32,
                    y: 0.0,
                    z: 0.0,
                },
            )
            .unwrap();
        world
            .add_component(e, Velocity { x: 1.0, y: 1.0, z: 1.0 })
            .unwrap();
    }
    let query = QueryBuilder::new()
        .with::<Position>()
        .with::<Velocity>()
        .build(&world)
        .unwrap();

    group.bench_function("iter_10k_two_columns", |b| {
        b.iter(|| {
            let mut total = 0.0f32;
            for view in query.iter(&world) {
                let positions = view.column::<Position>().unwrap();
                let velocities = view.column::<Velocity>().unwrap();
                for (p, v) in positions.iter().zip(velocities) {
                    total += p.x + v.x;
                }
            }
            black_box(total)
        });
    });

    group.finish();
}

criterion_group!(benches, bench_spawn, bench_migration, bench_query_iteration);
criterion_main!(benches);
