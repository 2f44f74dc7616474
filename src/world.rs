// Copyright 2025 Strata ECS contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! World: ownership root.
//!
//! A world exclusively owns its entity manager, event bus handle, dispatcher
//! handle and scratch resource storage. World ids are allocated process-wide
//! and recycled on drop, so entity handles can name their world in 10 bits.

use std::any::{Any, TypeId};
use std::sync::Arc;

use ahash::AHashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::dispatcher::Dispatcher;
use crate::entity::MAX_WORLD_COUNT;
use crate::event::EventBus;
use crate::manager::EntityManager;
use crate::version::WorldVersion;

#[derive(Default)]
struct WorldIdPool {
    next: u32,
    free: Vec<u32>,
}

static WORLD_IDS: Lazy<Mutex<WorldIdPool>> = Lazy::new(Default::default);

fn alloc_world_id() -> u32 {
    let mut pool = WORLD_IDS.lock();
    if let Some(id) = pool.free.pop() {
        return id;
    }
    let id = pool.next;
    assert!(
        (id as u64) < MAX_WORLD_COUNT,
        "world id space exhausted ({MAX_WORLD_COUNT} worlds)"
    );
    pool.next += 1;
    id
}

fn release_world_id(id: u32) {
    WORLD_IDS.lock().free.push(id);
}

/// Central ECS world
pub struct World {
    id: u32,
    manager: EntityManager,
    dispatcher: Arc<Dispatcher>,
    bus: Arc<EventBus>,
    resources: AHashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl World {
    /// World with its own default-size dispatcher
    pub fn new() -> Self {
        Self::with_dispatcher(Arc::new(Dispatcher::new()))
    }

    /// World sharing an existing dispatcher
    pub fn with_dispatcher(dispatcher: Arc<Dispatcher>) -> Self {
        let id = alloc_world_id();
        let bus = Arc::new(EventBus::new());
        let manager = EntityManager::new(id, dispatcher.thread_count(), bus.clone());
        Self {
            id,
            manager,
            dispatcher,
            bus,
            resources: AHashMap::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn version(&self) -> WorldVersion {
        self.manager.world_version()
    }

    /// Advance the world version and collect deferred destroys
    pub fn update(&mut self) {
        self.manager.update();
    }

    pub fn entities(&self) -> &EntityManager {
        &self.manager
    }

    pub fn entities_mut(&mut self) -> &mut EntityManager {
        &mut self.manager
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.bus
    }

    // ===== Resource API (scratch singleton storage) =====

    /// Insert a typed singleton, replacing any previous value
    pub fn insert_resource<R: Send + Sync + 'static>(&mut self, resource: R) {
        self.resources.insert(TypeId::of::<R>(), Box::new(resource));
    }

    pub fn resource<R: 'static>(&self) -> Option<&R> {
        self.resources
            .get(&TypeId::of::<R>())
            .and_then(|r| r.downcast_ref())
    }

    pub fn resource_mut<R: 'static>(&mut self) -> Option<&mut R> {
        self.resources
            .get_mut(&TypeId::of::<R>())
            .and_then(|r| r.downcast_mut())
    }

    pub fn has_resource<R: 'static>(&self) -> bool {
        self.resources.contains_key(&TypeId::of::<R>())
    }

    pub fn remove_resource<R: 'static>(&mut self) -> Option<R> {
        self.resources
            .remove(&TypeId::of::<R>())
            .and_then(|r| r.downcast().ok())
            .map(|boxed| *boxed)
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for World {
    fn drop(&mut self) {
        release_world_id(self.id);
    }
}
