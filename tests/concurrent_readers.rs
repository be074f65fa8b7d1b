//! Parallel readers against a mutating writer, dispose draining, and shared
//! metadata under concurrent archetype creation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chunked_ecs::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Position {
    x: f32,
    y: f32,
    z: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Velocity {
    x: f32,
    y: f32,
    z: f32,
}

fn table() -> Arc<ComponentTypeTable> {
    let mut builder = ComponentTypeTable::builder();
    builder.register::<Position>();
    builder.register::<Velocity>();
    builder.build()
}

fn setup() -> World {
    let metadata = ArchetypeMetadata::new(EcsConfig::default(), table()).unwrap();
    World::new(metadata)
}

/// Readers probe liveness and component data while one writer churns
/// structure. Readers must only ever observe coherent values.
#[test]
fn test_readers_during_structural_churn() {
    let world = setup();
    let stop = AtomicBool::new(false);

    // A stable population the readers key on.
    let mut stable = Vec::new();
    for i in 0..32u32 {
        let e = world.spawn().unwrap();
        world
            .add_component(e, Position { x: i as f32, y: i as f32, z: 0.0 })
            .unwrap();
        stable.push(e);
    }

    std::thread::scope(|scope| {
        let world = &world;
        let stable = &stable;
        let stop = &stop;

        for _ in 0..4 {
            scope.spawn(move || {
                let query = QueryBuilder::new().with::<Position>().build(world).unwrap();
                while !stop.load(Ordering::Relaxed) {
                    for &e in stable {
                        assert!(world.is_alive(e));
                        let position = world.get_component::<Position>(e).unwrap();
                        // x and y are written together; a torn row would
                        // disagree.
                        assert_eq!(position.x, position.y);
                    }
                    let mut visited = 0usize;
                    for view in query.iter(world) {
                        visited += view.len();
                    }
                    assert!(visited >= stable.len());
                }
            });
        }

        // Writer: churn a disjoint set of entities through migrations.
        scope.spawn(move || {
            for round in 0..200u32 {
                let e = world.spawn().unwrap();
                world
                    .add_component(
                        e,
                        Position {
                            x: round as f32,
                            y: round as f32,
                            z: 1.0,
                        },
                    )
                    .unwrap();
                world
                    .add_component(e, Velocity { x: 1.0, y: 1.0, z: 1.0 })
                    .unwrap();
                world.remove_component::<Velocity>(e).unwrap();
                world.despawn(e).unwrap();
            }
            stop.store(true, Ordering::Relaxed);
        });
    });

    // Stable population untouched by the churn.
    for (i, &e) in stable.iter().enumerate() {
        assert_eq!(world.get_component::<Position>(e).unwrap().x, i as f32);
    }
}

/// Dispose drains in-flight operations, then refuses everything.
#[test]
fn test_dispose_drains_and_refuses() {
    let world = setup();
    let seeded = world.spawn().unwrap();

    std::thread::scope(|scope| {
        let world = &world;
        let workers: Vec<_> = (0..4)
            .map(|_| {
                scope.spawn(move || {
                    let mut completed = 0u32;
                    loop {
                        match world.spawn() {
                            Ok(e) => {
                                completed += 1;
                                let _ = world.despawn(e);
                            }
                            Err(EcsError::Disposed) => return completed,
                            Err(other) => panic!("unexpected error: {other}"),
                        }
                    }
                })
            })
            .collect();

        std::thread::sleep(std::time::Duration::from_millis(10));
        world.dispose();

        for worker in workers {
            worker.join().unwrap();
        }
    });

    assert!(world.is_disposed());
    assert_eq!(world.spawn().unwrap_err(), EcsError::Disposed);
    assert_eq!(world.despawn(seeded).unwrap_err(), EcsError::Disposed);
    assert!(!world.is_alive(seeded));
    world.dispose(); // idempotent
}

/// Many threads interning overlapping masks against one shared metadata:
/// every thread resolves each mask to the same id.
#[test]
fn test_concurrent_interning_agrees() {
    let metadata = ArchetypeMetadata::new(EcsConfig::default(), table()).unwrap();

    let ids: Vec<Vec<ArchetypeId>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let metadata = Arc::clone(&metadata);
                scope.spawn(move || {
                    let mut out = Vec::new();
                    for bits in 1u32..32 {
                        let mut mask = ComponentMask::with_capacity(64);
                        for bit in 0..5 {
                            if bits & (1 << bit) != 0 {
                                mask.set(bit as usize).unwrap();
                            }
                        }
                        let (id, _) = metadata.get_or_create_archetype(&mask).unwrap();
                        out.push(id);
                    }
                    out
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for other in &ids[1..] {
        assert_eq!(&ids[0], other);
    }
    assert_eq!(metadata.archetype_count(), 31);
}

/// Two worlds over one metadata mutate independently and never observe each
/// other's entities.
#[test]
fn test_worlds_share_metadata_not_data() {
    let metadata = ArchetypeMetadata::new(EcsConfig::default(), table()).unwrap();
    let world_a = World::new(Arc::clone(&metadata));
    let world_b = World::new(Arc::clone(&metadata));

    std::thread::scope(|scope| {
        let a = &world_a;
        let b = &world_b;
        scope.spawn(move || {
            for i in 0..100u32 {
                let e = a.spawn().unwrap();
                a.add_component(e, Position { x: i as f32, y: 0.0, z: 0.0 })
                    .unwrap();
            }
        });
        scope.spawn(move || {
            for i in 0..100u32 {
                let e = b.spawn().unwrap();
                b.add_component(e, Velocity { x: i as f32, y: 0.0, z: 0.0 })
                    .unwrap();
            }
        });
    });

    assert_eq!(world_a.entity_count(), 100);
    assert_eq!(world_b.entity_count(), 100);

    let positions = QueryBuilder::new().with::<Position>().build(&world_a).unwrap();
    assert_eq!(positions.count(&world_a), 100);
    assert_eq!(positions.count(&world_b), 0);
}
