//! Synchronous typed event bus.
//!
//! Keyed by event type. `post` invokes subscribers synchronously, on the
//! posting thread, in subscription order. Subscribing returns a handle whose
//! drop detaches the subscriber.

use std::any::{Any, TypeId};
use std::sync::{Arc, Weak};

use ahash::AHashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::component::ComponentId;
use crate::entity::Entity;

/// Marker for event payloads
pub trait Event: Send + Sync + 'static {}

impl<T: Send + Sync + 'static> Event for T {}

/// Standard event posted by the `after_assign` hook glue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentAssigned {
    pub entity: Entity,
    pub component: ComponentId,
}

/// Standard event posted by the `before_remove` hook glue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentRemoved {
    pub entity: Entity,
    pub component: ComponentId,
}

type Handler = Arc<dyn Fn(&dyn Any) + Send + Sync>;

#[derive(Default)]
struct Channel {
    next_id: u64,
    subscribers: SmallVec<[(u64, Handler); 2]>,
}

#[derive(Default)]
struct Channels {
    by_type: AHashMap<TypeId, Channel>,
}

/// Synchronous pub/sub bus keyed by event type.
#[derive(Default)]
pub struct EventBus {
    channels: Mutex<Channels>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events of type `E`.
    ///
    /// Handlers run synchronously inside [`EventBus::post`], in subscription
    /// order. Dropping the returned handle detaches the subscriber.
    pub fn subscribe<E: Event, F>(self: &Arc<Self>, handler: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let type_id = TypeId::of::<E>();
        let erased: Handler = Arc::new(move |any: &dyn Any| {
            if let Some(event) = any.downcast_ref::<E>() {
                handler(event);
            }
        });

        let mut channels = self.channels.lock();
        let channel = channels.by_type.entry(type_id).or_default();
        let id = channel.next_id;
        channel.next_id += 1;
        channel.subscribers.push((id, erased));

        Subscription {
            bus: Arc::downgrade(self),
            type_id,
            id,
        }
    }

    /// Deliver `event` to every current subscriber of its type.
    ///
    /// The subscriber list is snapshotted before invocation, so handlers may
    /// subscribe, unsubscribe or post further events without deadlocking.
    pub fn post<E: Event>(&self, event: &E) {
        let handlers: SmallVec<[Handler; 4]> = {
            let channels = self.channels.lock();
            match channels.by_type.get(&TypeId::of::<E>()) {
                Some(channel) => channel.subscribers.iter().map(|(_, h)| h.clone()).collect(),
                None => return,
            }
        };
        for handler in handlers {
            handler(event);
        }
    }

    /// Number of live subscribers for an event type
    pub fn subscriber_count<E: Event>(&self) -> usize {
        self.channels
            .lock()
            .by_type
            .get(&TypeId::of::<E>())
            .map(|c| c.subscribers.len())
            .unwrap_or(0)
    }

    fn detach(&self, type_id: TypeId, id: u64) {
        let mut channels = self.channels.lock();
        if let Some(channel) = channels.by_type.get_mut(&type_id) {
            channel.subscribers.retain(|(sub_id, _)| *sub_id != id);
        }
    }
}

/// Subscription handle; dropping it detaches the subscriber.
pub struct Subscription {
    bus: Weak<EventBus>,
    type_id: TypeId,
    id: u64,
}

impl Subscription {
    /// Detach explicitly (same as drop)
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.detach(self.type_id, self.id);
        }
    }
}
