//! Entity lifecycle: creation, component add/remove, destructor accounting,
//! dependencies and id recycling.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use strata_ecs::prelude::*;
use strata_ecs::shared::SharedComponentsInfo;

#[derive(Default, Clone, Copy)]
struct C0 {
    value: i64,
}
impl Component for C0 {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::builder::<Self>().with_default().finish()
    }
}

#[derive(Default, Clone, Copy)]
struct C1 {
    value: i64,
}
impl Component for C1 {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::builder::<Self>().with_default().finish()
    }
}

fn world() -> World {
    World::with_dispatcher(Arc::new(Dispatcher::with_threads(2)))
}

#[test]
fn add_remove_reassign_cycle() {
    let mut world = world();
    let c0 = registry::register_component::<C0>();
    let c1 = registry::register_component::<C1>();
    let mask = ComponentMask::from_ids(&[c0, c1]);

    let em = world.entities_mut();
    let mut entities = Vec::new();
    for i in 0..100i64 {
        let entity = em.create_with(&mask, &SharedComponentsInfo::new()).unwrap();
        em.get_mut::<C0>(entity).unwrap().value = 777 + i;
        em.get_mut::<C1>(entity).unwrap().value = 999 + i;
        entities.push(entity);
    }

    for (i, &entity) in entities.iter().enumerate() {
        em.remove::<C0>(entity).unwrap();
        assert!(!em.has::<C0>(entity));
        assert!(em.has::<C1>(entity));
        assert_eq!(em.get::<C1>(entity).unwrap().value, 999 + i as i64);

        // removing again is a no-op
        em.remove::<C0>(entity).unwrap();
        assert!(!em.has::<C0>(entity));

        em.assign_value(entity, C0 { value: 12345 }).unwrap();
        assert_eq!(em.get::<C0>(entity).unwrap().value, 12345);
        assert_eq!(em.get::<C1>(entity).unwrap().value, 999 + i as i64);
    }
}

static OWNED_LIVE: AtomicUsize = AtomicUsize::new(0);

struct Owned(#[allow(dead_code)] Box<u64>);
impl Owned {
    fn new(value: u64) -> Self {
        OWNED_LIVE.fetch_add(1, Ordering::SeqCst);
        Self(Box::new(value))
    }
}
impl Drop for Owned {
    fn drop(&mut self) {
        OWNED_LIVE.fetch_sub(1, Ordering::SeqCst);
    }
}
impl Component for Owned {}

#[derive(Default, Clone, Copy)]
struct Holder(#[allow(dead_code)] Entity);
impl Component for Holder {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::builder::<Self>().with_default().finish()
    }
}

#[derive(Clone, Copy)]
struct Big([u8; 16 * 1024]);
impl Default for Big {
    fn default() -> Self {
        Self([0; 16 * 1024])
    }
}
impl Component for Big {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::builder::<Self>().with_default().finish()
    }
}

#[test]
fn mixed_removal_patterns_run_every_destructor() {
    let mut world = world();
    let owned = registry::register_component::<Owned>();
    let holder = registry::register_component::<Holder>();
    let big = registry::register_component::<Big>();
    let mask = ComponentMask::from_ids(&[owned, holder, big]);

    let em = world.entities_mut();
    let mut entities = Vec::new();
    for _ in 0..1024 {
        let entity = em.create_with(&mask, &SharedComponentsInfo::new()).unwrap();
        *em.get_mut::<Owned>(entity).unwrap() = Owned::new(entity.id() as u64);
        *em.get_mut::<Holder>(entity).unwrap() = Holder(entity);
        entities.push(entity);
    }
    assert_eq!(OWNED_LIVE.load(Ordering::SeqCst), 1024);

    let mut surviving_owned = 0usize;
    for (i, &entity) in entities.iter().enumerate() {
        if i % 2 == 0 {
            em.remove::<Owned>(entity).unwrap();
        } else {
            surviving_owned += 1;
        }
        if i % 3 == 0 {
            em.remove::<Holder>(entity).unwrap();
        }
        if i % 4 == 0 {
            em.remove::<Big>(entity).unwrap();
        }
    }

    for (i, &entity) in entities.iter().enumerate() {
        assert_eq!(em.has::<Owned>(entity), i % 2 != 0);
        assert_eq!(em.has::<Holder>(entity), i % 3 != 0);
        assert_eq!(em.has::<Big>(entity), i % 4 != 0);
    }
    // no destructor was skipped and none ran twice
    assert_eq!(OWNED_LIVE.load(Ordering::SeqCst), surviving_owned);
}

#[derive(Default, Clone, Copy)]
struct DepA;
impl Component for DepA {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::builder::<Self>().with_default().finish()
    }
}
#[derive(Default, Clone, Copy)]
struct DepB;
impl Component for DepB {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::builder::<Self>().with_default().finish()
    }
}
#[derive(Default, Clone, Copy)]
struct DepC;
impl Component for DepC {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::builder::<Self>().with_default().finish()
    }
}

#[test]
fn dependencies_apply_on_assign_not_on_remove() {
    let mut world = world();
    let a = registry::register_component::<DepA>();
    let b = registry::register_component::<DepB>();
    let c = registry::register_component::<DepC>();

    let em = world.entities_mut();
    em.add_dependency(a, &ComponentMask::from_ids(&[b, c])).unwrap();

    let entity = em.create();
    em.assign_value(entity, DepA).unwrap();
    assert!(em.has::<DepA>(entity));
    assert!(em.has::<DepB>(entity));
    assert!(em.has::<DepC>(entity));

    // removal is literal: the dependency does not re-attach B
    em.remove::<DepB>(entity).unwrap();
    assert!(em.has::<DepA>(entity));
    assert!(!em.has::<DepB>(entity));
    assert!(em.has::<DepC>(entity));

    em.remove::<DepA>(entity).unwrap();
    assert!(!em.has::<DepA>(entity));
    assert!(!em.has::<DepB>(entity));
    assert!(em.has::<DepC>(entity));
}

#[test]
fn self_dependency_rejected() {
    let mut world = world();
    let a = registry::register_component::<DepA>();
    let err = world
        .entities_mut()
        .add_dependency(a, &ComponentMask::from_ids(&[a]))
        .unwrap_err();
    assert!(matches!(err, EcsError::SelfDependency(_)));
}

#[test]
fn recycled_ids_bump_generation() {
    let mut world = world();
    let em = world.entities_mut();

    let first = em.create();
    let id = first.id();
    em.destroy_now(first);
    assert!(!em.is_valid(first));

    let second = em.create();
    assert_eq!(second.id(), id);
    assert!(second.generation() > first.generation());
    assert!(em.is_valid(second));
    assert!(!em.is_valid(first));

    // stale handles answer false / none everywhere
    assert!(!em.has::<C0>(first));
    assert!(em.get::<C0>(first).is_none());
    em.destroy_now(first); // no-op
    assert!(em.is_valid(second));
}

#[test]
fn locations_track_swap_removes() {
    let mut world = world();
    let c0 = registry::register_component::<C0>();
    let mask = ComponentMask::from_ids(&[c0]);

    let em = world.entities_mut();
    let entities: Vec<Entity> = (0..10)
        .map(|i| {
            let entity = em.create_with(&mask, &SharedComponentsInfo::new()).unwrap();
            em.get_mut::<C0>(entity).unwrap().value = i;
            entity
        })
        .collect();

    // destroying from the middle must keep every survivor reachable with
    // its own value
    em.destroy_now(entities[3]);
    em.destroy_now(entities[0]);
    for (i, &entity) in entities.iter().enumerate() {
        if i == 0 || i == 3 {
            assert!(!em.is_valid(entity));
        } else {
            assert_eq!(em.get::<C0>(entity).unwrap().value, i as i64);
        }
    }
}

#[test]
fn destroy_only_entity_keeps_archetype() {
    let mut world = world();
    let c0 = registry::register_component::<C0>();
    let mask = ComponentMask::from_ids(&[c0]);

    let em = world.entities_mut();
    let archetype = em.archetype_index_of(&mask, &SharedComponentsInfo::new()).unwrap();
    let entity = em.create_with(&mask, &SharedComponentsInfo::new()).unwrap();
    em.destroy_now(entity);

    assert_eq!(em.archetype(archetype).size(), 0);
    // archetype survives and accepts new entities
    let entity = em.create_with(&mask, &SharedComponentsInfo::new()).unwrap();
    assert_eq!(em.archetype_of(entity), Some(archetype));
}

#[test]
fn chunk_constraint_infeasibility_is_fatal_at_creation() {
    let mut world = world();
    let c0 = registry::register_component::<C0>();
    let c1 = registry::register_component::<C1>();
    let mask = ComponentMask::from_ids(&[c0, c1]);

    let em = world.entities_mut();
    em.add_chunk_size_for(ComponentMask::from_ids(&[c0]), 64, 0);
    em.add_chunk_size_for(ComponentMask::from_ids(&[c1]), 0, 16);

    let err = em
        .archetype_index_of(&mask, &SharedComponentsInfo::new())
        .unwrap_err();
    assert!(matches!(err, EcsError::ChunkConstraint { min: 64, max: 16 }));
}
