//! End-to-end scenarios: archetype lifecycle, growth, exclusion queries, raw
//! components, and drop accounting across every path a value can leave the
//! store by.

use std::alloc::Layout;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use strata_ecs::prelude::*;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, PartialEq)]
struct Name(String);

#[derive(Debug, Clone, PartialEq)]
struct Test(i64);

/// Counts how many times a value of this type has been dropped.
#[derive(Debug)]
struct DropCounter {
    drops: Arc<AtomicUsize>,
    value: u64,
}

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct OtherCounter(Arc<AtomicUsize>);

impl Drop for OtherCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Name / Test scenario
// ---------------------------------------------------------------------------

#[test]
fn despawn_middle_entity_keeps_archetypes() {
    init_tracing();
    let mut world = World::new();
    world.register_component::<Name>("name");
    world.register_component::<Test>("test");

    let first = world.spawn_with(Name("first".into())).unwrap();
    let middle = world
        .spawn(
            ComponentBundle::new()
                .with(world.registry(), Name("middle".into()))
                .unwrap()
                .with(world.registry(), Test(42))
                .unwrap(),
        )
        .unwrap();
    let third = world.spawn_with(Name("third".into())).unwrap();
    let name_test = world.location(&middle).unwrap().archetype;

    world.despawn(middle).unwrap();

    let names: Vec<_> = world
        .query::<(&Name,)>()
        .map(|(id, (name,))| (id, name.0.clone()))
        .collect();
    assert_eq!(
        names,
        vec![
            (first.id(), "first".to_string()),
            (third.id(), "third".to_string())
        ]
    );
    assert_eq!(world.location(&first).unwrap().row, 0);
    assert_eq!(world.location(&third).unwrap().row, 1);

    assert_eq!(world.query::<(&Name, &Test)>().count(), 0);
    let archetype = world.archetype(name_test).unwrap();
    assert!(archetype.is_empty());
    assert_eq!(archetype.signature().len(), 2);
    assert_eq!(world.archetype_count(), 2);
    world.check_integrity().unwrap();
}

// ---------------------------------------------------------------------------
// Growth
// ---------------------------------------------------------------------------

#[test]
fn growth_from_zero_keeps_every_row() {
    init_tracing();
    let mut world = World::new();
    world.register_component::<Test>("test");
    world.register_component::<Name>("name");

    const N: i64 = 1_000;
    let handles: Vec<Entity> = (0..N)
        .map(|i| {
            let bundle = ComponentBundle::new()
                .with(world.registry(), Test(i))
                .unwrap()
                .with(world.registry(), Name(format!("e{i}")))
                .unwrap();
            world.spawn(bundle).unwrap()
        })
        .collect();

    for (i, handle) in handles.iter().enumerate() {
        assert_eq!(world.get::<Test>(handle).unwrap(), &Test(i as i64));
        assert_eq!(world.get::<Name>(handle).unwrap(), &Name(format!("e{i}")));
    }

    let archetype = world
        .archetype(world.location(&handles[0]).unwrap().archetype)
        .unwrap();
    let test = world.registry().lookup::<Test>().unwrap();
    let column: Vec<i64> = archetype
        .column_slice::<Test>(test)
        .unwrap()
        .iter()
        .map(|t| t.0)
        .collect();
    assert_eq!(column, (0..N).collect::<Vec<_>>());
    assert!(archetype.capacity() > N as usize);
    world.check_integrity().unwrap();
}

#[test]
fn custom_growth_factor() {
    let mut world = World::with_config(WorldConfig {
        growth_factor: 2.0,
        initial_capacity: 0,
    })
    .unwrap();
    world.register_component::<Test>("test");

    let mut seen = Vec::new();
    let mut handles = Vec::new();
    for i in 0..20 {
        handles.push(world.spawn_with(Test(i)).unwrap());
        let location = world.location(&handles[0]).unwrap();
        let capacity = world.archetype(location.archetype).unwrap().capacity();
        if seen.last() != Some(&capacity) {
            seen.push(capacity);
        }
    }
    // ceil((cap + 1) * 2), triggered whenever len + 1 reaches capacity.
    assert_eq!(seen, vec![2, 6, 14, 30]);
}

// ---------------------------------------------------------------------------
// Drop accounting
// ---------------------------------------------------------------------------

#[test]
fn every_value_dropped_exactly_once() {
    init_tracing();
    let drops = Arc::new(AtomicUsize::new(0));
    let other = Arc::new(AtomicUsize::new(0));
    let counter = |value| DropCounter {
        drops: drops.clone(),
        value,
    };

    {
        let mut world = World::new();
        world.register_component::<DropCounter>("counter");
        world.register_component::<OtherCounter>("other");
        world.register_component::<Test>("test");

        let mut handles: Vec<Entity> = (0..50)
            .map(|i| world.spawn_with(counter(i)).unwrap())
            .collect();

        // Migration carries values without dropping them.
        for handle in handles.iter().step_by(2) {
            world.add_component(handle, Test(0)).unwrap();
        }
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        // Migration out of an archetype drops the removed component only.
        for handle in handles.iter().step_by(3) {
            world
                .add_component(handle, OtherCounter(other.clone()))
                .unwrap();
        }
        for handle in handles.iter().step_by(3) {
            world.remove_component::<OtherCounter>(handle).unwrap();
        }
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        assert_eq!(other.load(Ordering::SeqCst), 17);

        // remove_component drops, take_component hands the value back.
        world.remove_component::<DropCounter>(&handles[1]).unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        let taken = world.take_component::<DropCounter>(&handles[3]).unwrap();
        assert_eq!(taken.value, 3);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        drop(taken);
        assert_eq!(drops.load(Ordering::SeqCst), 2);

        // Despawn drops the whole row.
        for handle in handles.drain(40..) {
            world.despawn(handle).unwrap();
        }
        assert_eq!(drops.load(Ordering::SeqCst), 12);
        world.check_integrity().unwrap();
    }

    // Teardown drops the remaining 38 counters.
    assert_eq!(drops.load(Ordering::SeqCst), 50);
    assert_eq!(other.load(Ordering::SeqCst), 17);
}

#[test]
fn rejected_values_are_dropped() {
    let drops = Arc::new(AtomicUsize::new(0));
    let mut world = World::new();
    world.register_component::<OtherCounter>("other");

    let e = world.spawn_with(OtherCounter(drops.clone())).unwrap();
    assert!(world.add_component(&e, OtherCounter(drops.clone())).is_err());
    assert_eq!(drops.load(Ordering::SeqCst), 1);

    let mut bundle = ComponentBundle::new();
    bundle.add(world.registry(), OtherCounter(drops.clone())).unwrap();
    assert!(bundle.add(world.registry(), OtherCounter(drops.clone())).is_err());
    assert_eq!(drops.load(Ordering::SeqCst), 2);
    drop(bundle);
    assert_eq!(drops.load(Ordering::SeqCst), 3);
}

// ---------------------------------------------------------------------------
// Exclusion queries
// ---------------------------------------------------------------------------

#[test]
fn include_and_exclude_sets() {
    let mut world = World::new();
    let name = world.register_component::<Name>("name");
    let test = world.register_component::<Test>("test");

    let only_name = world.spawn_with(Name("a".into())).unwrap();
    let only_test = world.spawn_with(Test(1)).unwrap();
    let both = world
        .spawn(
            ComponentBundle::new()
                .with(world.registry(), Name("b".into()))
                .unwrap()
                .with(world.registry(), Test(2))
                .unwrap(),
        )
        .unwrap();

    let ids = |descriptor: &QueryDescriptor, world: &World| -> Vec<EntityId> {
        world.matching_rows(descriptor).map(|(id, _, _)| id).collect()
    };

    let name_not_test =
        QueryDescriptor::new(Signature::from_ids([name]), Signature::from_ids([test])).unwrap();
    assert_eq!(ids(&name_not_test, &world), vec![only_name.id()]);

    let test_only = QueryDescriptor::new(Signature::from_ids([test]), Signature::new()).unwrap();
    assert_eq!(ids(&test_only, &world), vec![only_test.id(), both.id()]);

    let nothing_with_name =
        QueryDescriptor::new(Signature::new(), Signature::from_ids([name])).unwrap();
    assert_eq!(ids(&nothing_with_name, &world), vec![only_test.id()]);
}

// ---------------------------------------------------------------------------
// Raw components
// ---------------------------------------------------------------------------

static RAW_MOVES: AtomicUsize = AtomicUsize::new(0);
static RAW_DROPS: AtomicUsize = AtomicUsize::new(0);

unsafe fn raw_move(dst: *mut u8, src: *mut u8) {
    RAW_MOVES.fetch_add(1, Ordering::SeqCst);
    unsafe { ptr::copy_nonoverlapping(src, dst, 16) };
}

unsafe fn raw_drop(_ptr: *mut u8) {
    RAW_DROPS.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn raw_component_uses_its_vtable() {
    let mut world = World::new();
    let layout = Layout::from_size_align(16, 8).unwrap();
    let vtable = unsafe { ComponentVtable::from_raw(raw_move, raw_drop) };
    // SAFETY: the vtable moves 16 bytes and the blob holds plain integers.
    let blob = unsafe { world.register_component_raw("blob", layout, vtable) };
    assert_eq!(world.registry().size_of(blob).unwrap(), 16);
    world.register_component::<Test>("test");

    let mut handles = Vec::new();
    for i in 0..10u64 {
        let mut value = [i, i * 100];
        let mut bundle = ComponentBundle::new();
        unsafe {
            bundle
                .add_raw(world.registry(), blob, value.as_mut_ptr().cast::<u8>())
                .unwrap();
        }
        handles.push(world.spawn(bundle).unwrap());
    }
    let moves_after_spawn = RAW_MOVES.load(Ordering::SeqCst);
    assert!(moves_after_spawn >= 20, "bundle + archetype moves");

    let read = |world: &World, entity: &Entity| -> [u64; 2] {
        let ptr = world.get_raw(entity, blob).unwrap();
        unsafe { ptr.as_ptr().cast::<[u64; 2]>().read() }
    };
    for (i, handle) in handles.iter().enumerate() {
        assert_eq!(read(&world, handle), [i as u64, i as u64 * 100]);
    }

    world.add_component(&handles[4], Test(4)).unwrap();
    assert_eq!(read(&world, &handles[4]), [4, 400]);
    assert_eq!(RAW_DROPS.load(Ordering::SeqCst), 0);

    world.remove_component_by_id(&handles[5], blob).unwrap();
    assert_eq!(RAW_DROPS.load(Ordering::SeqCst), 1);
    assert_eq!(world.location(&handles[5]), None);

    drop(world);
    assert_eq!(RAW_DROPS.load(Ordering::SeqCst), 10);
}

// ---------------------------------------------------------------------------
// Handles and errors
// ---------------------------------------------------------------------------

#[test]
fn foreign_handles_never_alias_local_entities() {
    let mut world = World::new();
    world.register_component::<Test>("test");
    let mut other = World::new();
    other.register_component::<Test>("test");

    let local = world.spawn_with(Test(1)).unwrap();
    let foreign = other.spawn_with(Test(2)).unwrap();
    let stray = other.spawn_with(Test(3)).unwrap();

    // Same index and generation, different world.
    assert_eq!(local.id(), foreign.id());
    assert_ne!(local, foreign);
    assert!(matches!(
        world.get::<Test>(&foreign),
        Err(EcsError::ForeignEntity(id)) if id == foreign.id()
    ));
    assert!(matches!(
        world.get::<Test>(&stray),
        Err(EcsError::ForeignEntity(_))
    ));
    assert!(matches!(
        world.add_component(&foreign, Test(9)),
        Err(EcsError::ForeignEntity(_))
    ));
    assert_eq!(world.location(&foreign), None);
    assert_eq!(world.get::<Test>(&local).unwrap(), &Test(1));
    assert_eq!(other.get::<Test>(&foreign).unwrap(), &Test(2));
    world.check_integrity().unwrap();
    other.check_integrity().unwrap();
}

#[test]
fn bundle_from_another_world_is_rejected() {
    init_tracing();
    let drops = Arc::new(AtomicUsize::new(0));

    let mut source = World::new();
    source.register_component::<DropCounter>("counter");
    let mut target = World::new();
    // Component id 0 in the target is a different type of a different size.
    target.register_component::<u64>("number");

    let bundle = ComponentBundle::new()
        .with(
            source.registry(),
            DropCounter {
                drops: drops.clone(),
                value: 7,
            },
        )
        .unwrap();
    assert_eq!(bundle.world_id(), Some(source.id()));

    let err = target.spawn(bundle).unwrap_err();
    assert!(matches!(
        err,
        EcsError::ForeignBundle { bundle, world } if bundle == source.id() && world == target.id()
    ));
    // The rejected bundle is dropped with its value, never reinterpreted.
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert_eq!(target.entity_count(), 0);
    assert_eq!(target.query::<(&u64,)>().count(), 0);
    target.check_integrity().unwrap();
}

#[test]
fn dropped_handle_leaves_queries_and_counts() {
    init_tracing();
    let drops = Arc::new(AtomicUsize::new(0));
    let mut world = World::new();
    world.register_component::<OtherCounter>("other");
    world.register_component::<Test>("test");

    let kept = world.spawn_with(OtherCounter(drops.clone())).unwrap();
    let temporary = world.spawn_with(OtherCounter(drops.clone())).unwrap();
    let temporary_id = temporary.id();
    assert_eq!(world.entity_count(), 2);
    assert_eq!(world.query::<(&OtherCounter,)>().count(), 2);

    drop(temporary);
    // Reads skip the row straight away.
    assert_eq!(world.entity_count(), 1);
    assert!(!world.is_alive(temporary_id));
    let ids: Vec<_> = world.query::<(&OtherCounter,)>().map(|(id, _)| id).collect();
    assert_eq!(ids, vec![kept.id()]);
    assert_eq!(drops.load(Ordering::SeqCst), 0);

    // The next mutation reclaims the row and drops its components.
    world.add_component(&kept, Test(1)).unwrap();
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert_eq!(world.entity_count(), 1);
    assert_eq!(world.query::<(&OtherCounter,)>().count(), 1);
    world.check_integrity().unwrap();

    // Explicit despawn disarms the handle, so nothing is queued twice.
    world.despawn(kept).unwrap();
    assert_eq!(drops.load(Ordering::SeqCst), 2);
    assert_eq!(world.despawn_dropped(), 0);
    assert_eq!(world.entity_count(), 0);
}

#[test]
fn archetypes_where_and_column_slices() {
    let mut world = World::new();
    let name = world.register_component::<Name>("name");
    world.register_component::<Test>("test");

    let mut handles = Vec::new();
    for i in 0..5 {
        let e = world.spawn_with(Test(i)).unwrap();
        if i % 2 == 0 {
            world.add_component(&e, Name(format!("n{i}"))).unwrap();
        }
        handles.push(e);
    }

    let with_name = world.archetypes_where(|archetype| archetype.has_component(name));
    assert_eq!(with_name.len(), 1);

    let archetype = world.archetype(with_name[0]).unwrap();
    let names: Vec<&str> = archetype
        .column_slice::<Name>(name)
        .unwrap()
        .iter()
        .map(|n| n.0.as_str())
        .collect();
    assert_eq!(names, vec!["n0", "n2", "n4"]);
    assert!(archetype.column_slice::<Test>(name).is_none());
}
