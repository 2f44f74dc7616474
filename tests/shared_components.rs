//! Shared components: interning by equality and archetype variants.

use std::sync::Arc;

use strata_ecs::prelude::*;
use strata_ecs::shared::SharedComponentsInfo;

#[derive(Default, Clone, Copy)]
struct Pos {
    #[allow(dead_code)]
    x: f32,
}
impl Component for Pos {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::builder::<Self>().with_default().finish()
    }
}

#[derive(PartialEq, Debug)]
struct Material {
    texture: u32,
    shader: u32,
}
impl SharedComponent for Material {}

fn world() -> World {
    World::with_dispatcher(Arc::new(Dispatcher::with_threads(2)))
}

#[test]
fn equal_values_intern_to_one_instance() {
    let mut world = world();
    let pos = registry::register_component::<Pos>();
    let mask = ComponentMask::from_ids(&[pos]);

    let em = world.entities_mut();
    let a = em.create_with(&mask, &SharedComponentsInfo::new()).unwrap();
    let b = em.create_with(&mask, &SharedComponentsInfo::new()).unwrap();

    em.assign_shared_value(a, Material { texture: 1, shader: 2 }).unwrap();
    em.assign_shared_value(b, Material { texture: 1, shader: 2 }).unwrap();

    // same interned value, same archetype variant
    assert_eq!(em.archetype_of(a), em.archetype_of(b));
    let value_a = em.get_shared::<Material>(a).unwrap() as *const Material;
    let value_b = em.get_shared::<Material>(b).unwrap() as *const Material;
    assert_eq!(value_a, value_b);
}

#[test]
fn different_values_split_archetypes() {
    let mut world = world();
    let pos = registry::register_component::<Pos>();
    let mask = ComponentMask::from_ids(&[pos]);

    let em = world.entities_mut();
    let a = em.create_with(&mask, &SharedComponentsInfo::new()).unwrap();
    let b = em.create_with(&mask, &SharedComponentsInfo::new()).unwrap();

    em.assign_shared_value(a, Material { texture: 1, shader: 0 }).unwrap();
    em.assign_shared_value(b, Material { texture: 2, shader: 0 }).unwrap();

    // identical unique mask, different binding: distinct archetypes
    let arch_a = em.archetype_of(a).unwrap();
    let arch_b = em.archetype_of(b).unwrap();
    assert_ne!(arch_a, arch_b);
    assert_eq!(em.archetype(arch_a).mask(), em.archetype(arch_b).mask());

    assert_eq!(em.get_shared::<Material>(a).unwrap().texture, 1);
    assert_eq!(em.get_shared::<Material>(b).unwrap().texture, 2);
}

#[test]
fn unique_components_survive_rebinding() {
    let mut world = world();
    let pos = registry::register_component::<Pos>();
    let mask = ComponentMask::from_ids(&[pos]);

    let em = world.entities_mut();
    let entity = em.create_with(&mask, &SharedComponentsInfo::new()).unwrap();
    em.get_mut::<Pos>(entity).unwrap().x = 5.5;

    em.assign_shared_value(entity, Material { texture: 7, shader: 7 }).unwrap();
    assert_eq!(em.get::<Pos>(entity).unwrap().x, 5.5);

    // rebinding to another value moves the entity again
    em.assign_shared_value(entity, Material { texture: 8, shader: 8 }).unwrap();
    assert_eq!(em.get_shared::<Material>(entity).unwrap().texture, 8);
    assert_eq!(em.get::<Pos>(entity).unwrap().x, 5.5);
}

#[test]
fn remove_shared_returns_to_plain_variant() {
    let mut world = world();
    let pos = registry::register_component::<Pos>();
    let material = registry::register_shared_component::<Material>();
    let mask = ComponentMask::from_ids(&[pos]);

    let em = world.entities_mut();
    let plain = em.create_with(&mask, &SharedComponentsInfo::new()).unwrap();
    let bound = em.create_with(&mask, &SharedComponentsInfo::new()).unwrap();
    em.assign_shared_value(bound, Material { texture: 3, shader: 3 }).unwrap();
    assert_ne!(em.archetype_of(plain), em.archetype_of(bound));

    assert!(em.remove_shared(bound, material).unwrap());
    assert_eq!(em.archetype_of(plain), em.archetype_of(bound));
    assert!(em.get_shared::<Material>(bound).is_none());

    // removing again reports absence
    assert!(!em.remove_shared(bound, material).unwrap());
}

#[test]
fn shared_assign_rejected_while_locked() {
    let mut world = world();
    let em = world.entities_mut();
    let entity = em.create();

    em.lock();
    let err = em
        .assign_shared_value(entity, Material { texture: 0, shader: 0 })
        .unwrap_err();
    assert!(matches!(err, EcsError::Locked(_)));
    em.unlock();
}
