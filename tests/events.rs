//! Event bus glue: components wired with assign/remove notifications.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use strata_ecs::event::{ComponentAssigned, ComponentRemoved};
use strata_ecs::prelude::*;
use strata_ecs::shared::SharedComponentsInfo;

#[derive(Default, Clone, Copy)]
struct Notifying {
    #[allow(dead_code)]
    value: u32,
}

impl Component for Notifying {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::builder::<Self>()
            .with_default()
            .with_assign_events(|| registry::register_component::<Notifying>())
            .finish()
    }
}

#[test]
fn assign_and_remove_post_standard_events() {
    let mut world = World::with_dispatcher(Arc::new(Dispatcher::with_threads(2)));
    let id = registry::register_component::<Notifying>();

    let assigned = Arc::new(AtomicUsize::new(0));
    let removed = Arc::new(AtomicUsize::new(0));
    let bus = world.events().clone();

    let a = assigned.clone();
    let _on_assign = bus.subscribe(move |event: &ComponentAssigned| {
        assert_eq!(event.component, registry::register_component::<Notifying>());
        a.fetch_add(1, Ordering::SeqCst);
    });
    let r = removed.clone();
    let _on_remove = bus.subscribe(move |event: &ComponentRemoved| {
        assert_eq!(event.component, registry::register_component::<Notifying>());
        r.fetch_add(1, Ordering::SeqCst);
    });

    let em = world.entities_mut();

    // typed assign fires after-assign once
    let entity = em.create();
    em.assign_value(entity, Notifying { value: 1 }).unwrap();
    assert_eq!(assigned.load(Ordering::SeqCst), 1);
    assert_eq!(removed.load(Ordering::SeqCst), 0);

    // removal fires before-remove once
    em.remove::<Notifying>(entity).unwrap();
    assert_eq!(removed.load(Ordering::SeqCst), 1);

    // construction during create fires after-assign too
    let mask = ComponentMask::from_ids(&[id]);
    let second = em.create_with(&mask, &SharedComponentsInfo::new()).unwrap();
    assert_eq!(assigned.load(Ordering::SeqCst), 2);

    // destroy runs the before-remove hook for carried components
    em.destroy_now(second);
    assert_eq!(removed.load(Ordering::SeqCst), 2);
}

#[test]
fn dropped_subscription_stops_delivery() {
    let mut world = World::with_dispatcher(Arc::new(Dispatcher::with_threads(2)));
    let assigned = Arc::new(AtomicUsize::new(0));
    let bus = world.events().clone();

    let a = assigned.clone();
    let subscription = bus.subscribe(move |_: &ComponentAssigned| {
        a.fetch_add(1, Ordering::SeqCst);
    });

    let em = world.entities_mut();
    let entity = em.create();
    em.assign_value(entity, Notifying { value: 1 }).unwrap();
    assert_eq!(assigned.load(Ordering::SeqCst), 1);

    subscription.unsubscribe();
    let other = em.create();
    em.assign_value(other, Notifying { value: 2 }).unwrap();
    assert_eq!(assigned.load(Ordering::SeqCst), 1);
}
