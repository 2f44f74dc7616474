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

//! Entity manager: id allocation, archetype table and lifecycle.
//!
//! Entity ids are dense slots with a free list threaded through the id field
//! of dead entries; every release bumps the slot's generation, invalidating
//! prior handles. `locations[id]` tracks which (archetype, slot) a live
//! entity occupies.
//!
//! The manager is *locked* while jobs iterate. Crossing 0→1 freezes
//! structural mutation: create/destroy/assign/remove calls append to a
//! per-thread temporal log instead, and crossing 1→0 replays every log in
//! (thread id, log order). Reads are never logged; they observe the pre-lock
//! snapshot.

use std::cell::UnsafeCell;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use tracing::trace;

use crate::archetype::Archetype;
use crate::component::{Component, ComponentId, SharedComponentId};
use crate::dispatcher;
use crate::entity::{Entity, EntityLocation};
use crate::error::{EcsError, Result};
use crate::event::EventBus;
use crate::mask::ComponentMask;
use crate::registry;
use crate::shared::{SharedComponent, SharedComponentsInfo, SharedPtr};
use crate::temporal::{Action, CreateInfo, TemporalStorage};
use crate::version::WorldVersion;

/// Default per-chunk byte budget an archetype's chunk capacity is derived
/// from (clamped by registered predicates).
pub const DEFAULT_CHUNK_BYTES: usize = 1 << 20;

/// Chunk-capacity bounds produced by a user predicate; 0 means unconstrained.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkSizeLimits {
    pub min: u32,
    pub max: u32,
}

type ChunkSizeFn = Box<dyn Fn(&ComponentMask) -> ChunkSizeLimits + Send + Sync>;
type VersionFilterFn = Box<dyn Fn(&ComponentMask) -> ComponentMask + Send + Sync>;

#[derive(PartialEq, Eq, Hash)]
struct ArchetypeKey {
    mask: ComponentMask,
    shared: SharedComponentsInfo,
}

/// Per-thread slots written without synchronisation.
///
/// Each pool thread only ever touches its own slot (the dispatcher hands out
/// stable ids), so no two threads alias one cell.
struct PerThread<T> {
    slots: Vec<UnsafeCell<T>>,
}

unsafe impl<T: Send> Sync for PerThread<T> {}

impl<T: Default> PerThread<T> {
    fn new(count: usize) -> Self {
        Self {
            slots: (0..count).map(|_| UnsafeCell::new(T::default())).collect(),
        }
    }

    fn len(&self) -> usize {
        self.slots.len()
    }

    /// # Safety
    /// `index` must be the calling thread's own id; no other thread may use
    /// the same index concurrently.
    #[allow(clippy::mut_from_ref)]
    unsafe fn get(&self, index: usize) -> &mut T {
        &mut *self.slots[index].get()
    }

    fn get_mut(&mut self, index: usize) -> &mut T {
        self.slots[index].get_mut()
    }
}

pub struct EntityManager {
    world_id: u32,
    world_version: WorldVersion,

    entities: Vec<Entity>,
    locations: Vec<EntityLocation>,
    next_slot: u32,
    empty_slots: u32,

    archetypes: Vec<Archetype>,
    archetype_index: AHashMap<ArchetypeKey, u32>,
    dependencies: AHashMap<ComponentId, ComponentMask>,
    shared_values: Vec<Vec<SharedPtr>>,

    marked_for_destroy: BTreeSet<Entity>,
    lock_counter: u32,
    next_locked_id: AtomicU32,
    temporal: PerThread<TemporalStorage>,
    unoptimized_replay: bool,

    bus: Arc<EventBus>,

    default_chunk_bytes: usize,
    chunk_size_fns: Vec<ChunkSizeFn>,
    version_filter: Option<VersionFilterFn>,
}

impl EntityManager {
    pub(crate) fn new(world_id: u32, worker_count: u32, bus: Arc<EventBus>) -> Self {
        let mut manager = Self {
            world_id,
            world_version: WorldVersion::FIRST,
            entities: Vec::new(),
            locations: Vec::new(),
            next_slot: 0,
            empty_slots: 0,
            archetypes: Vec::with_capacity(32),
            archetype_index: AHashMap::with_capacity(32),
            dependencies: AHashMap::new(),
            shared_values: Vec::new(),
            marked_for_destroy: BTreeSet::new(),
            lock_counter: 0,
            next_locked_id: AtomicU32::new(0),
            temporal: PerThread::new(worker_count as usize + 1),
            unoptimized_replay: false,
            bus,
            default_chunk_bytes: DEFAULT_CHUNK_BYTES,
            chunk_size_fns: Vec::new(),
            version_filter: None,
        };
        // the empty archetype always sits at index 0
        manager
            .get_or_create_archetype(&ComponentMask::new(), &SharedComponentsInfo::new(), false)
            .expect("empty archetype has no constraints");
        manager
    }

    // ===== versions & configuration =====

    pub fn world_id(&self) -> u32 {
        self.world_id
    }

    pub fn world_version(&self) -> WorldVersion {
        self.world_version
    }

    pub(crate) fn bump_version(&mut self) -> WorldVersion {
        self.world_version = self.world_version.next();
        self.world_version
    }

    /// Per-chunk byte budget used to derive chunk capacities of archetypes
    /// created after the call
    pub fn set_default_chunk_bytes(&mut self, bytes: usize) {
        self.default_chunk_bytes = bytes.max(1);
    }

    /// Register a chunk-capacity predicate consulted at archetype creation
    pub fn add_chunk_size_fn(
        &mut self,
        f: impl Fn(&ComponentMask) -> ChunkSizeLimits + Send + Sync + 'static,
    ) {
        self.chunk_size_fns.push(Box::new(f));
    }

    /// Convenience: clamp chunk capacity for archetypes containing all of
    /// `mask`
    pub fn add_chunk_size_for(&mut self, mask: ComponentMask, min: u32, max: u32) {
        self.add_chunk_size_fn(move |arch_mask| {
            if arch_mask.is_match(&mask) {
                ChunkSizeLimits { min, max }
            } else {
                ChunkSizeLimits::default()
            }
        });
    }

    /// Restrict which components of future archetypes carry version words.
    /// Without a filter, every component participates.
    pub fn set_version_filter(
        &mut self,
        f: impl Fn(&ComponentMask) -> ComponentMask + Send + Sync + 'static,
    ) {
        self.version_filter = Some(Box::new(f));
    }

    /// Force one-by-one replay of temporal logs (reference behavior)
    pub fn set_unoptimized_replay(&mut self, on: bool) {
        self.unoptimized_replay = on;
    }

    // ===== locking =====

    pub fn is_locked(&self) -> bool {
        self.lock_counter > 0
    }

    /// Re-entrant. Crossing 0→1 freezes structural mutation and reserves the
    /// provisional id range for locked creates.
    pub fn lock(&mut self) {
        self.lock_counter += 1;
        if self.lock_counter == 1 {
            self.next_locked_id
                .store(self.entities.len() as u32, Ordering::Release);
        }
    }

    /// Crossing 1→0 replays every per-thread temporal log in thread-id
    /// order.
    pub fn unlock(&mut self) {
        if self.lock_counter == 0 {
            return;
        }
        self.lock_counter -= 1;
        if self.lock_counter == 0 {
            self.apply_temporal_logs();
        }
    }

    // ===== validation & reads =====

    /// A handle is valid iff the world id matches, the id is in range and
    /// the stored generation equals the handle's.
    pub fn is_valid(&self, entity: Entity) -> bool {
        if entity.is_null() || entity.world_id() != self.world_id {
            return false;
        }
        let id = entity.id() as usize;
        match self.entities.get(id) {
            Some(stored) => stored.generation() == entity.generation(),
            None => false,
        }
    }

    pub fn location_of(&self, entity: Entity) -> Option<EntityLocation> {
        if !self.is_valid(entity) {
            return None;
        }
        let location = self.locations[entity.id() as usize];
        if location.is_null() {
            None
        } else {
            Some(location)
        }
    }

    pub fn archetype_of(&self, entity: Entity) -> Option<u32> {
        self.location_of(entity).map(|l| l.archetype)
    }

    pub fn has_component(&self, entity: Entity, id: ComponentId) -> bool {
        match self.location_of(entity) {
            Some(location) => self.archetypes[location.archetype as usize].has_component(id),
            None => false,
        }
    }

    pub fn has<T: Component>(&self, entity: Entity) -> bool {
        self.has_component(entity, registry::register_component::<T>())
    }

    /// Const pointer to a component, or `None` for invalid handles and
    /// absent components
    pub fn get_component_ptr(&self, entity: Entity, id: ComponentId) -> Option<*const u8> {
        let location = self.location_of(entity)?;
        let archetype = &self.archetypes[location.archetype as usize];
        let index = archetype.component_index(id)?;
        Some(archetype.const_component_ptr(index, location.slot))
    }

    /// Mutable pointer to a component; stamps the column dirty at the
    /// current world version
    pub fn get_component_ptr_mut(&mut self, entity: Entity, id: ComponentId) -> Option<*mut u8> {
        let location = self.location_of(entity)?;
        let version = self.world_version;
        let archetype = &mut self.archetypes[location.archetype as usize];
        let index = archetype.component_index(id)?;
        Some(archetype.component_ptr_mut(index, location.slot, version))
    }

    pub fn get<T: Component>(&self, entity: Entity) -> Option<&T> {
        let id = registry::register_component::<T>();
        self.get_component_ptr(entity, id)
            .map(|ptr| unsafe { &*(ptr as *const T) })
    }

    pub fn get_mut<T: Component>(&mut self, entity: Entity) -> Option<&mut T> {
        let id = registry::register_component::<T>();
        self.get_component_ptr_mut(entity, id)
            .map(|ptr| unsafe { &mut *(ptr as *mut T) })
    }

    pub fn get_shared<T: SharedComponent>(&self, entity: Entity) -> Option<&T> {
        let id = registry::register_shared_component::<T>();
        let location = self.location_of(entity)?;
        let archetype = &self.archetypes[location.archetype as usize];
        archetype
            .shared_info()
            .get(id)
            .and_then(|ptr| ptr.as_any().downcast_ref::<T>())
    }

    pub fn has_shared_component(&self, entity: Entity, id: SharedComponentId) -> bool {
        match self.location_of(entity) {
            Some(location) => self.archetypes[location.archetype as usize]
                .shared_info()
                .has(id),
            None => false,
        }
    }

    /// Version of the last write to `id` on this entity's chunk (falls back
    /// to the archetype-global word when chunk tracking is off)
    pub fn world_version_of_last_update(
        &self,
        entity: Entity,
        id: ComponentId,
    ) -> Option<WorldVersion> {
        let location = self.location_of(entity)?;
        let archetype = &self.archetypes[location.archetype as usize];
        let index = archetype.component_index(id)?;
        let chunk = location.slot as usize / archetype.chunk_capacity().max(1) as usize;
        let version = archetype.chunk_component_version(chunk, index);
        if version.is_null() {
            Some(archetype.global_component_version(index))
        } else {
            Some(version)
        }
    }

    pub fn mark_dirty(&mut self, entity: Entity, id: ComponentId) {
        if let Some(location) = self.location_of(entity) {
            let version = self.world_version;
            let archetype = &mut self.archetypes[location.archetype as usize];
            if let Some(index) = archetype.component_index(id) {
                archetype.mark_dirty(index, location.slot, version);
            }
        }
    }

    // ===== archetype table =====

    pub fn archetype_count(&self) -> usize {
        self.archetypes.len()
    }

    pub fn archetype(&self, index: u32) -> &Archetype {
        &self.archetypes[index as usize]
    }

    pub(crate) fn archetype_mut(&mut self, index: u32) -> &mut Archetype {
        &mut self.archetypes[index as usize]
    }

    pub fn archetypes(&self) -> &[Archetype] {
        &self.archetypes
    }

    /// Union of the extra components every id in `mask` pulls in
    fn extra_components(&self, mask: &ComponentMask) -> ComponentMask {
        let mut result = ComponentMask::new();
        if !self.dependencies.is_empty() {
            for id in mask.ones() {
                if let Some(extra) = self.dependencies.get(&id) {
                    result = result.merge(extra);
                }
            }
        }
        result
    }

    /// Declare that `master` implies `extra` on every create/assign lookup.
    /// Dependencies are closed transitively at registration time.
    pub fn add_dependency(&mut self, master: ComponentId, extra: &ComponentMask) -> Result<()> {
        if extra.has(master) {
            let name = registry::with_component_info(master, |info| info.name.clone());
            return Err(EcsError::SelfDependency(name));
        }
        let closed = extra.merge(&self.extra_components(extra));
        let entry = self.dependencies.entry(master).or_default();
        *entry = entry.merge(&closed);
        Ok(())
    }

    /// Find or create the archetype for `(mask, shared)`.
    ///
    /// `apply_deps` unions registered dependencies into the mask; create and
    /// assign paths do, removal paths do not.
    pub(crate) fn get_or_create_archetype(
        &mut self,
        mask: &ComponentMask,
        shared: &SharedComponentsInfo,
        apply_deps: bool,
    ) -> Result<u32> {
        let mask = if apply_deps {
            mask.merge(&self.extra_components(mask))
        } else {
            mask.clone()
        };
        let key = ArchetypeKey {
            mask,
            shared: shared.clone(),
        };
        if let Some(&index) = self.archetype_index.get(&key) {
            return Ok(index);
        }

        let ArchetypeKey { mask, shared } = key;

        // chunk capacity from the byte budget, clamped by predicates
        let mut bytes_per_entity = std::mem::size_of::<Entity>();
        for id in mask.ones() {
            bytes_per_entity += registry::with_component_info(id, |info| info.size);
        }
        let mut capacity = (self.default_chunk_bytes / bytes_per_entity.max(1)).max(1) as u32;

        let mut min = 0u32;
        let mut max = 0u32;
        for f in &self.chunk_size_fns {
            let limits = f(&mask);
            if limits.min > 0 && (min == 0 || limits.min > min) {
                min = limits.min;
            }
            if limits.max > 0 && (max == 0 || limits.max < max) {
                max = limits.max;
            }
        }
        if max > 0 && max < min {
            return Err(EcsError::ChunkConstraint { min, max });
        }
        if capacity < min {
            capacity = min;
        }
        if max > 0 && capacity > max {
            capacity = max;
        }

        let enabled = match &self.version_filter {
            Some(f) => f(&mask),
            None => ComponentMask::all(),
        };

        let index = self.archetypes.len() as u32;
        self.archetypes
            .push(Archetype::new(index, mask.clone(), shared.clone(), capacity, &enabled));
        self.archetype_index.insert(ArchetypeKey { mask, shared }, index);
        Ok(index)
    }

    /// Typed lookup used by tests and the world API
    pub fn archetype_index_of(
        &mut self,
        mask: &ComponentMask,
        shared: &SharedComponentsInfo,
    ) -> Result<u32> {
        self.get_or_create_archetype(mask, shared, true)
    }

    // ===== id allocation =====

    fn alloc_entity(&mut self) -> Entity {
        if self.empty_slots == 0 {
            let entity = Entity::new(self.entities.len() as u32, 0, self.world_id);
            self.entities.push(entity);
            self.locations.push(EntityLocation::default());
            entity
        } else {
            let id = self.next_slot;
            let stored = self.entities[id as usize];
            self.next_slot = stored.id();
            let entity = Entity::new(id, stored.generation(), self.world_id);
            self.entities[id as usize] = entity;
            self.locations[id as usize] = EntityLocation::default();
            self.empty_slots -= 1;
            entity
        }
    }

    fn release_entity_id(&mut self, entity: Entity) {
        let id = entity.id();
        if id as usize >= self.entities.len() {
            return;
        }
        // thread the free list through the id field, pre-bump the generation
        let next = if self.empty_slots > 0 {
            self.next_slot
        } else {
            id.wrapping_add(1)
        };
        self.entities[id as usize] = entity.with_next_generation().with_id(next);
        self.locations[id as usize] = EntityLocation::default();
        self.next_slot = id;
        self.empty_slots += 1;
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len() - self.empty_slots as usize
    }

    // ===== create / destroy =====

    /// Create an entity in the empty archetype. Safe while locked (returns a
    /// provisional handle reconciled at unlock).
    pub fn create(&mut self) -> Entity {
        if self.is_locked() {
            return self.create_locked(ComponentMask::new(), SharedComponentsInfo::new());
        }
        let entity = self.alloc_entity();
        let version = self.world_version;
        let bus = self.bus.clone();
        let slot = self.archetypes[0].insert(entity, &ComponentMask::new(), version, &bus);
        self.locations[entity.id() as usize] = EntityLocation { archetype: 0, slot };
        entity
    }

    /// Create an entity carrying `mask` (plus dependencies) and the given
    /// shared bindings. Safe while locked.
    pub fn create_with(
        &mut self,
        mask: &ComponentMask,
        shared: &SharedComponentsInfo,
    ) -> Result<Entity> {
        if self.is_locked() {
            return Ok(self.create_locked(mask.clone(), shared.clone()));
        }
        let archetype = self.get_or_create_archetype(mask, shared, true)?;
        Ok(self.create_in(archetype))
    }

    /// Create an entity directly in an existing archetype. Safe while
    /// locked.
    pub fn create_in(&mut self, archetype: u32) -> Entity {
        if self.is_locked() {
            let mask = self.archetypes[archetype as usize].mask().clone();
            let shared = self.archetypes[archetype as usize].shared_info().clone();
            return self.create_locked(mask, shared);
        }
        let entity = self.alloc_entity();
        let version = self.world_version;
        let bus = self.bus.clone();
        let slot = self.archetypes[archetype as usize].insert(
            entity,
            &ComponentMask::new(),
            version,
            &bus,
        );
        self.locations[entity.id() as usize] = EntityLocation { archetype, slot };
        entity
    }

    fn create_locked(&self, mask: ComponentMask, shared: SharedComponentsInfo) -> Entity {
        let id = self.next_locked_id.fetch_add(1, Ordering::AcqRel);
        let generation = match self.entities.get(id as usize) {
            Some(stored) => stored.generation(),
            None => 0,
        };
        let entity = Entity::new(id, generation, self.world_id);
        self.temporal_storage().create(entity, mask, shared);
        entity
    }

    /// Deferred destroy: marked now, collected at the next [`Self::update`].
    /// Safe while locked.
    pub fn destroy(&mut self, entity: Entity) {
        if self.is_locked() {
            self.temporal_storage().destroy(entity);
        } else {
            self.marked_for_destroy.insert(entity);
        }
    }

    pub fn is_marked_for_destroy(&self, entity: Entity) -> bool {
        self.marked_for_destroy.contains(&entity)
    }

    /// Immediate destroy: swap-remove from the archetype and release the id.
    /// No-op on invalid handles. While locked the destroy is logged and
    /// applied at unlock.
    pub fn destroy_now(&mut self, entity: Entity) {
        if self.is_locked() {
            self.temporal_storage().destroy_now(entity);
            return;
        }
        if !self.is_valid(entity) {
            return;
        }
        let location = self.locations[entity.id() as usize];
        if !location.is_null() {
            let version = self.world_version;
            let bus = self.bus.clone();
            let swapped = self.archetypes[location.archetype as usize].remove(
                location.slot,
                &ComponentMask::new(),
                version,
                &bus,
            );
            if let Some(swapped) = swapped {
                self.locations[swapped.id() as usize].slot = location.slot;
            }
        }
        self.release_entity_id(entity);
    }

    /// Advance the world version and collect everything marked for destroy.
    pub fn update(&mut self) {
        self.bump_version();
        let marked = std::mem::take(&mut self.marked_for_destroy);
        for entity in marked {
            self.destroy_now(entity);
        }
    }

    /// Destroy every entity; archetypes and their buffers survive.
    pub fn clear(&mut self) {
        for archetype in &mut self.archetypes {
            archetype.clear();
        }
        self.entities.clear();
        self.locations.clear();
        self.next_slot = 0;
        self.empty_slots = 0;
        self.marked_for_destroy.clear();
    }

    /// Release every entity of one archetype, then drain it in place.
    pub fn clear_archetype(&mut self, archetype: u32) {
        let size = self.archetypes[archetype as usize].size();
        for slot in 0..size {
            let entity = self.archetypes[archetype as usize].entity_at(slot);
            self.release_entity_id(entity);
        }
        self.archetypes[archetype as usize].clear();
    }

    // ===== structural component ops =====

    /// Move `entity` to `dst` (must differ from its current archetype);
    /// columns present on both sides relocate, new columns obey `skip_init`.
    fn relocate(&mut self, entity: Entity, dst: u32, skip_init: &ComponentMask) -> u32 {
        let id = entity.id() as usize;
        let location = self.locations[id];
        debug_assert_ne!(location.archetype, dst);

        let version = self.world_version;
        let bus = self.bus.clone();
        let (dst_arch, src_arch) = Self::two_archetypes(&mut self.archetypes, dst, location.archetype);
        let (slot, swapped) =
            dst_arch.external_move(entity, src_arch, location.slot, skip_init, version, &bus);

        if let Some(swapped) = swapped {
            self.locations[swapped.id() as usize].slot = location.slot;
        }
        self.locations[id] = EntityLocation {
            archetype: dst,
            slot,
        };
        slot
    }

    fn two_archetypes(
        archetypes: &mut [Archetype],
        a: u32,
        b: u32,
    ) -> (&mut Archetype, &mut Archetype) {
        debug_assert_ne!(a, b);
        if a < b {
            let (left, right) = archetypes.split_at_mut(b as usize);
            (&mut left[a as usize], &mut right[0])
        } else {
            let (left, right) = archetypes.split_at_mut(a as usize);
            (&mut right[0], &mut left[b as usize])
        }
    }

    /// Attach component `id` and return a pointer to it.
    ///
    /// With `skip_ctor` the default-construct hook does not run and the
    /// caller must write the value before reading it; an already-present
    /// value is dropped first in that case. While locked the assignment goes
    /// to the temporal log and the returned pointer lives in its arena until
    /// unlock.
    pub fn assign(&mut self, entity: Entity, id: ComponentId, skip_ctor: bool) -> Result<*mut u8> {
        if self.is_locked() {
            return Ok(self
                .temporal_storage()
                .assign_component(entity, id, skip_ctor));
        }
        if !self.is_valid(entity) {
            return Err(EcsError::InvalidEntity);
        }
        let location = self.locations[entity.id() as usize];
        let prev = &self.archetypes[location.archetype as usize];

        if let Some(index) = prev.component_index(id) {
            // already present: overwrite in place
            let version = self.world_version;
            let archetype = &mut self.archetypes[location.archetype as usize];
            let ptr = archetype.component_ptr_mut(index, location.slot, version);
            if skip_ctor {
                let dtor = registry::with_component_info(id, |info| info.functions.dtor);
                if let Some(dtor) = dtor {
                    unsafe { dtor(ptr) };
                }
            }
            return Ok(ptr);
        }

        let mask = prev.mask().clone().with(id);
        let shared = prev.shared_info().clone();
        let dst = self.get_or_create_archetype(&mask, &shared, true)?;

        let skip_init = if skip_ctor {
            ComponentMask::new().with(id)
        } else {
            ComponentMask::new()
        };
        let slot = self.relocate(entity, dst, &skip_init);
        let archetype = &self.archetypes[dst as usize];
        let index = archetype
            .component_index(id)
            .expect("destination archetype carries the assigned component");
        Ok(archetype.component_ptr_silent(index, slot))
    }

    /// Typed assign: writes `value` and fires the after-assign hook.
    pub fn assign_value<T: Component>(&mut self, entity: Entity, value: T) -> Result<&mut T> {
        let id = registry::register_component::<T>();
        let ptr = self.assign(entity, id, true)?;
        unsafe { std::ptr::write(ptr as *mut T, value) };
        if !self.is_locked() {
            // hooks run outside the registry lock: they may register types
            let hook = registry::with_component_info(id, |info| info.functions.after_assign);
            if let Some(after_assign) = hook {
                unsafe { after_assign(ptr, entity, &self.bus) };
            }
        }
        Ok(unsafe { &mut *(ptr as *mut T) })
    }

    /// Detach component `id`. No-op when the entity does not carry it.
    /// Safe while locked.
    pub fn remove_component(&mut self, entity: Entity, id: ComponentId) -> Result<()> {
        if self.is_locked() {
            self.temporal_storage().remove_component(entity, id);
            return Ok(());
        }
        if !self.is_valid(entity) {
            return Err(EcsError::InvalidEntity);
        }
        let location = self.locations[entity.id() as usize];
        let prev = &self.archetypes[location.archetype as usize];
        if !prev.has_component(id) {
            return Ok(());
        }
        let mut mask = prev.mask().clone();
        mask.set(id, false);
        let shared = prev.shared_info().clone();
        // dependencies are not re-applied here: removal is literal
        let dst = self.get_or_create_archetype(&mask, &shared, false)?;
        if dst != location.archetype {
            self.relocate(entity, dst, &ComponentMask::new());
        }
        Ok(())
    }

    pub fn remove<T: Component>(&mut self, entity: Entity) -> Result<()> {
        self.remove_component(entity, registry::register_component::<T>())
    }

    // ===== shared components =====

    /// Intern `value`: returns the canonical instance equal to it
    fn intern_shared(&mut self, id: SharedComponentId, value: SharedPtr) -> SharedPtr {
        let index = id.index() as usize;
        if self.shared_values.len() <= index {
            self.shared_values.resize_with(index + 1, Vec::new);
        }
        let list = &mut self.shared_values[index];
        for existing in list.iter() {
            if Arc::ptr_eq(existing, &value) || existing.eq_value(&*value) {
                return existing.clone();
            }
        }
        list.push(value.clone());
        value
    }

    /// Bind a shared value; relocates the entity to the archetype variant
    /// with the updated binding. Not available while locked.
    pub fn assign_shared(
        &mut self,
        entity: Entity,
        value: SharedPtr,
        id: SharedComponentId,
    ) -> Result<SharedPtr> {
        if self.is_locked() {
            return Err(EcsError::Locked("assign_shared"));
        }
        if !self.is_valid(entity) {
            return Err(EcsError::InvalidEntity);
        }
        let interned = self.intern_shared(id, value);

        let location = self.locations[entity.id() as usize];
        let prev = &self.archetypes[location.archetype as usize];
        let mut shared = prev.shared_info().clone();
        shared.add(id, interned.clone());

        let mask = prev.mask().clone();
        let dst = self.get_or_create_archetype(&mask, &shared, false)?;
        if dst != location.archetype {
            self.relocate(entity, dst, &ComponentMask::new());
        }
        Ok(interned)
    }

    pub fn assign_shared_value<T: SharedComponent>(
        &mut self,
        entity: Entity,
        value: T,
    ) -> Result<SharedPtr> {
        let id = registry::register_shared_component::<T>();
        self.assign_shared(entity, Arc::new(value), id)
    }

    /// Drop a shared binding. Returns whether the entity had it. Not
    /// available while locked.
    pub fn remove_shared(&mut self, entity: Entity, id: SharedComponentId) -> Result<bool> {
        if self.is_locked() {
            return Err(EcsError::Locked("remove_shared"));
        }
        if !self.is_valid(entity) {
            return Err(EcsError::InvalidEntity);
        }
        let location = self.locations[entity.id() as usize];
        let prev = &self.archetypes[location.archetype as usize];
        let mut shared = prev.shared_info().clone();
        if !shared.remove(id) {
            return Ok(false);
        }
        let mask = prev.mask().clone();
        let dst = self.get_or_create_archetype(&mask, &shared, false)?;
        if dst != location.archetype {
            self.relocate(entity, dst, &ComponentMask::new());
        }
        Ok(true)
    }

    // ===== temporal log =====

    /// This thread's temporal log.
    ///
    /// Uses the dispatcher thread id; each pool thread (and the submitter,
    /// id 0) owns exactly one slot, so the unsynchronised access cannot
    /// alias.
    #[allow(clippy::mut_from_ref)]
    fn temporal_storage(&self) -> &mut TemporalStorage {
        let thread = dispatcher::current_thread_id() as usize;
        debug_assert!(thread < self.temporal.len());
        unsafe { self.temporal.get(thread) }
    }

    fn apply_temporal_logs(&mut self) {
        let thread_count = self.temporal.len();
        for thread in 0..thread_count {
            let (mut actions, infos) = self.temporal.get_mut(thread).take_parts();
            if actions.is_empty() {
                continue;
            }
            trace!(thread, actions = actions.len(), "replaying temporal log");
            if self.unoptimized_replay {
                for action in actions.iter_mut() {
                    self.apply_action(action, &infos);
                }
            } else {
                self.apply_actions_grouped(&mut actions, &infos);
            }
            // destroy-wins leftovers keep their payloads; drop them now
            for action in actions.iter() {
                if let Action::Assign {
                    ptr,
                    dtor: Some(dtor),
                    live: true,
                    ..
                } = action
                {
                    unsafe { (*dtor)(*ptr) };
                }
            }
            self.temporal.get_mut(thread).clear();
        }
    }

    /// Grouped replay: consecutive actions on one entity collapse into a
    /// single relocation. Must be observationally identical to
    /// [`Self::apply_action`] run one-by-one.
    fn apply_actions_grouped(&mut self, actions: &mut [Action], infos: &[CreateInfo]) {
        let mut begin = 0;
        while begin < actions.len() {
            let entity = actions[begin].entity();
            let mut end = begin + 1;
            while end < actions.len() && actions[end].entity() == entity {
                end += 1;
            }
            if end - begin == 1 {
                self.apply_action(&mut actions[begin], infos);
            } else {
                self.apply_action_pack(entity, &mut actions[begin..end], infos);
            }
            begin = end;
        }
    }

    fn apply_action(&mut self, action: &mut Action, infos: &[CreateInfo]) {
        match action {
            Action::Create { entity, info } => {
                let (mask, shared) = match info {
                    Some(index) => {
                        let info = &infos[*index as usize];
                        (info.mask.clone(), info.shared.clone())
                    }
                    None => (ComponentMask::new(), SharedComponentsInfo::new()),
                };
                self.materialize_created(*entity, &mask, &shared);
            }
            Action::Destroy { entity } => {
                self.marked_for_destroy.insert(*entity);
            }
            Action::DestroyNow { entity } => {
                self.destroy_now(*entity);
            }
            Action::Remove { entity, component } => {
                if self.is_valid(*entity) {
                    let _ = self.remove_component(*entity, *component);
                }
            }
            Action::Assign {
                entity,
                component,
                ptr,
                size,
                dtor,
                live,
            } => {
                if !self.is_valid(*entity) {
                    // the destroy won; drop the payload silently
                    if let (Some(dtor), true) = (*dtor, *live) {
                        unsafe { dtor(*ptr) };
                    }
                    *live = false;
                    return;
                }
                match self.assign(*entity, *component, true) {
                    Ok(dst) => {
                        unsafe { std::ptr::copy_nonoverlapping(*ptr, dst, *size) };
                        *live = false;
                        let hook = registry::with_component_info(*component, |info| {
                            info.functions.after_assign
                        });
                        if let Some(after_assign) = hook {
                            unsafe { after_assign(dst, *entity, &self.bus) };
                        }
                    }
                    Err(_) => {
                        if let (Some(dtor), true) = (*dtor, *live) {
                            unsafe { dtor(*ptr) };
                        }
                        *live = false;
                    }
                }
            }
        }
    }

    /// One relocation for a run of actions on the same entity.
    ///
    /// The net mask is computed by simulating the actions in order (an
    /// assign after a remove re-adds the component and its dependencies, a
    /// remove after an assign wins), then a reverse scan keeps the last
    /// payload per surviving component and drops the superseded ones.
    fn apply_action_pack(&mut self, entity: Entity, actions: &mut [Action], infos: &[CreateInfo]) {
        let mut created: Option<(ComponentMask, SharedComponentsInfo)> = None;
        let mut destroyed_now = false;
        let mut deferred_destroy = false;

        for action in actions.iter() {
            match action {
                Action::Create { info, .. } => {
                    created = Some(match info {
                        Some(index) => {
                            let info = &infos[*index as usize];
                            (info.mask.clone(), info.shared.clone())
                        }
                        None => (ComponentMask::new(), SharedComponentsInfo::new()),
                    });
                }
                Action::Destroy { .. } => deferred_destroy = true,
                Action::DestroyNow { .. } => destroyed_now = true,
                _ => {}
            }
        }

        if destroyed_now {
            // everything collapses; payloads are dropped by the caller's
            // leftover sweep. An entity created and destroyed in the same
            // log never materializes, but its id stays burned.
            if created.is_none() {
                if self.is_valid(entity) {
                    self.destroy_now(entity);
                }
            } else {
                self.burn_provisional_id(entity);
            }
            return;
        }

        let (base_mask, shared) = match &created {
            Some((mask, shared)) => {
                self.materialize_created(entity, mask, shared);
                (
                    self.archetypes[self.locations[entity.id() as usize].archetype as usize]
                        .mask()
                        .clone(),
                    shared.clone(),
                )
            }
            None => {
                if !self.is_valid(entity) {
                    return; // destroy won before this pack; payloads swept by caller
                }
                let location = self.locations[entity.id() as usize];
                let archetype = &self.archetypes[location.archetype as usize];
                (archetype.mask().clone(), archetype.shared_info().clone())
            }
        };

        // order-sensitive mask simulation
        let mut target = base_mask.clone();
        for action in actions.iter() {
            match action {
                Action::Assign { component, .. } => {
                    let added = ComponentMask::new().with(*component);
                    target = target.merge(&added).merge(&self.extra_components(&added));
                }
                Action::Remove { component, .. } => {
                    target.set(*component, false);
                }
                _ => {}
            }
        }

        // reverse scan: keep the last payload per component still in the
        // target mask, drop the rest
        let mut survivors = ComponentMask::new();
        let mut removed_later = ComponentMask::new();
        let mut removed_in_pack = ComponentMask::new();
        for action in actions.iter_mut().rev() {
            match action {
                Action::Remove { component, .. } => {
                    removed_later.set(*component, true);
                    removed_in_pack.set(*component, true);
                }
                Action::Assign {
                    component,
                    ptr,
                    dtor,
                    live,
                    ..
                } => {
                    if !*live {
                        continue;
                    }
                    if removed_later.has(*component) || survivors.has(*component) {
                        if let Some(dtor) = dtor {
                            unsafe { (*dtor)(*ptr) };
                        }
                        *live = false;
                    } else {
                        survivors.set(*component, true);
                    }
                }
                _ => {}
            }
        }

        // one relocation; surviving fresh columns skip their constructors
        // because the payload overwrites them
        let location = self.locations[entity.id() as usize];
        if *self.archetypes[location.archetype as usize].mask() != target {
            let dst = self
                .get_or_create_archetype(&target, &shared, false)
                .expect("archetype creation failed during replay");
            if dst != location.archetype {
                let fresh = survivors.subtract(&base_mask);
                self.relocate(entity, dst, &fresh);
            }
        }

        // move surviving payloads in (forward order is irrelevant now: one
        // payload per component remains)
        for action in actions.iter_mut() {
            if let Action::Assign {
                component,
                ptr,
                size,
                live,
                ..
            } = action
            {
                if !*live {
                    continue;
                }
                let location = self.locations[entity.id() as usize];
                let archetype = &self.archetypes[location.archetype as usize];
                let index = archetype
                    .component_index(*component)
                    .expect("net archetype carries every surviving assign");
                let dst = archetype.component_ptr_silent(index, location.slot);
                let functions = registry::with_component_info(*component, |info| info.functions);
                if base_mask.has(*component) {
                    // the moved-in value is still alive; end its lifetime
                    // the way sequential replay would have
                    if removed_in_pack.has(*component) {
                        if let Some(before_remove) = functions.before_remove {
                            unsafe { before_remove(dst, entity, &self.bus) };
                        }
                    }
                    if let Some(dtor) = functions.dtor {
                        unsafe { dtor(dst) };
                    }
                }
                unsafe { std::ptr::copy_nonoverlapping(*ptr, dst, *size) };
                *live = false;
                if let Some(after_assign) = functions.after_assign {
                    unsafe { after_assign(dst, entity, &self.bus) };
                }
            }
        }

        if deferred_destroy {
            self.marked_for_destroy.insert(entity);
        }
    }

    /// Give a provisional entity its slot and archetype.
    fn materialize_created(
        &mut self,
        entity: Entity,
        mask: &ComponentMask,
        shared: &SharedComponentsInfo,
    ) {
        let id = entity.id() as usize;
        if id >= self.entities.len() {
            // ids from other threads' logs may still be pending; leave
            // placeholder gaps they will overwrite
            for gap in self.entities.len()..=id {
                self.entities
                    .push(Entity::new(gap as u32, 0, self.world_id));
                self.locations.push(EntityLocation::default());
            }
        }
        self.entities[id] = entity;
        self.locations[id] = EntityLocation::default();

        let archetype = self
            .get_or_create_archetype(mask, shared, true)
            .expect("archetype creation failed during replay");
        let version = self.world_version;
        let bus = self.bus.clone();
        let slot =
            self.archetypes[archetype as usize].insert(entity, &ComponentMask::new(), version, &bus);
        self.locations[id] = EntityLocation { archetype, slot };
    }

    /// A provisional entity that was destroyed before materializing: record
    /// the slot so the id is not handed out again at generation 0.
    fn burn_provisional_id(&mut self, entity: Entity) {
        let id = entity.id() as usize;
        if id >= self.entities.len() {
            for gap in self.entities.len()..=id {
                self.entities
                    .push(Entity::new(gap as u32, 0, self.world_id));
                self.locations.push(EntityLocation::default());
            }
        }
        self.entities[id] = entity;
        self.locations[id] = EntityLocation::default();
        self.release_entity_id(entity);
    }
}

impl std::fmt::Debug for EntityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityManager")
            .field("world_id", &self.world_id)
            .field("entities", &self.entities.len())
            .field("archetypes", &self.archetypes.len())
            .field("locked", &self.is_locked())
            .finish()
    }
}
