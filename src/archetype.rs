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

//! Archetype storage.
//!
//! An archetype is an immutable (component mask, shared bindings) pair owning
//! columnar storage for every entity that carries exactly that combination:
//! one entity column plus one component column per unique component, all
//! index-parallel, sliced into chunks of `chunk_capacity` slots for version
//! tracking. Structural operations (insert, swap-remove, cross-archetype
//! move) dispatch through the precomputed operation table; there is no
//! registry access on the hot path.
//!
//! Swap-remove preserves no order between entities. Callers must not depend
//! on slot stability across removals; pointers previously returned for a
//! column may dangle after one.

use smallvec::SmallVec;
use tracing::debug;

use crate::component::ComponentId;
use crate::entity::Entity;
use crate::event::EventBus;
use crate::mask::ComponentMask;
use crate::ops::OperationTable;
use crate::shared::SharedComponentsInfo;
use crate::stable::StableColumn;
use crate::version::{VersionParam, VersionStorage, WorldVersion};

pub struct Archetype {
    index: u32,
    mask: ComponentMask,
    shared: SharedComponentsInfo,
    ops: OperationTable,
    entities: StableColumn,
    columns: Vec<StableColumn>,
    versions: VersionStorage,
    chunk_capacity: u32,
    size: u32,
    name: String,
}

impl Archetype {
    pub(crate) fn new(
        index: u32,
        mask: ComponentMask,
        shared: SharedComponentsInfo,
        chunk_capacity: u32,
        version_enabled: &ComponentMask,
    ) -> Self {
        debug_assert!(chunk_capacity >= 1);
        let ops = OperationTable::new(&mask);

        let mut name = String::new();
        for column in &ops.columns {
            name.push_str(" [");
            name.push_str(&column.name);
            name.push(']');
        }

        let columns = ops
            .columns
            .iter()
            .map(|c| StableColumn::new(c.size, c.align))
            .collect();
        let enabled = ops
            .columns
            .iter()
            .map(|c| version_enabled.has(c.id))
            .collect();
        let versions = VersionStorage::new(ops.num_components(), chunk_capacity, enabled);

        debug!(
            archetype = index,
            components = %name,
            chunk_capacity,
            "new archetype"
        );

        Self {
            index,
            mask,
            shared,
            entities: StableColumn::new(
                std::mem::size_of::<Entity>(),
                std::mem::align_of::<Entity>(),
            ),
            columns,
            versions,
            chunk_capacity,
            size: 0,
            ops,
            name,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn mask(&self) -> &ComponentMask {
        &self.mask
    }

    pub fn shared_info(&self) -> &SharedComponentsInfo {
        &self.shared
    }

    pub fn chunk_capacity(&self) -> u32 {
        self.chunk_capacity
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_components(&self) -> usize {
        self.ops.num_components()
    }

    /// Position of a component's column, if this archetype carries it
    pub fn component_index(&self, id: ComponentId) -> Option<usize> {
        self.ops.component_index(id)
    }

    pub fn has_component(&self, id: ComponentId) -> bool {
        self.mask.has(id)
    }

    pub fn component_id_at(&self, component_index: usize) -> ComponentId {
        self.ops.columns[component_index].id
    }

    pub fn entity_at(&self, slot: u32) -> Entity {
        debug_assert!(slot < self.size);
        unsafe { *(self.entities.slot_ptr(slot as usize) as *const Entity) }
    }

    /// Pointer to the entity column slot; used by job iteration
    pub(crate) fn entity_ptr(&self, slot: u32) -> *const Entity {
        self.entities.slot_ptr(slot as usize) as *const Entity
    }

    /// Const pointer into a component column
    pub fn const_component_ptr(&self, component_index: usize, slot: u32) -> *const u8 {
        debug_assert!(slot < self.size);
        self.columns[component_index].slot_ptr(slot as usize)
    }

    /// Mutable pointer into a component column; stamps the column dirty at
    /// `version`
    pub fn component_ptr_mut(
        &mut self,
        component_index: usize,
        slot: u32,
        version: WorldVersion,
    ) -> *mut u8 {
        debug_assert!(slot < self.size);
        self.mark_dirty(component_index, slot, version);
        self.columns[component_index].slot_ptr(slot as usize)
    }

    /// Mutable pointer without a version stamp (job columns are stamped in
    /// bulk by the filter's set mask)
    pub(crate) fn component_ptr_silent(&self, component_index: usize, slot: u32) -> *mut u8 {
        self.columns[component_index].slot_ptr(slot as usize)
    }

    pub fn mark_dirty(&mut self, component_index: usize, slot: u32, version: WorldVersion) {
        let chunk = self.versions.chunk_at(slot as usize);
        self.versions.stamp(version, chunk, component_index);
    }

    /// Interned shared value bound to `id`, as a raw payload pointer
    pub fn shared_value_ptr(&self, id: crate::component::SharedComponentId) -> Option<*const u8> {
        self.shared
            .get(id)
            .map(|ptr| &**ptr as *const dyn crate::shared::SharedValue as *const u8)
    }

    /// Ascending slot indices where some column's dual-buffer storage stops
    /// being memory-contiguous. Each column migrates at its own pace (the
    /// batch size depends on the element size), so the entity column and the
    /// component columns can sit at different cursors; job arrays must not
    /// cross any of them.
    pub(crate) fn storage_boundaries(&self) -> SmallVec<[usize; 4]> {
        let mut boundaries: SmallVec<[usize; 4]> = SmallVec::new();
        for boundary in std::iter::once(self.entities.boundary())
            .chain(self.columns.iter().map(|column| column.boundary()))
        {
            if boundary != usize::MAX && boundary != 0 {
                if let Err(position) = boundaries.binary_search(&boundary) {
                    boundaries.insert(position, boundary);
                }
            }
        }
        boundaries
    }

    pub(crate) fn versions_mut(&mut self) -> &mut VersionStorage {
        &mut self.versions
    }

    pub fn global_component_version(&self, component_index: usize) -> WorldVersion {
        self.versions.global_version(component_index)
    }

    pub fn chunk_component_version(&self, chunk: usize, component_index: usize) -> WorldVersion {
        self.versions.chunk_version(chunk, component_index)
    }

    /// Index of the last chunk currently holding entities
    pub fn last_chunk_index(&self) -> usize {
        if self.size == 0 {
            0
        } else {
            (self.size as usize - 1) / self.chunk_capacity as usize
        }
    }

    /// Translate an id mask into a [`VersionParam`] over this archetype's
    /// component indices
    pub fn version_param(&self, mask: &ComponentMask, version: WorldVersion) -> VersionParam {
        let finite = self.mask.intersection(mask);
        VersionParam {
            version,
            components: finite
                .ones()
                .filter_map(|id| self.component_index(id))
                .collect(),
        }
    }

    /// Append a slot for `entity`.
    ///
    /// Default-construct hooks run for every column not in `skip_ctor`;
    /// columns without a hook are left with undefined contents and must be
    /// written before being read. Size is incremented only after all
    /// constructions succeeded. Versions of the affected chunk are stamped.
    pub(crate) fn insert(
        &mut self,
        entity: Entity,
        skip_ctor: &ComponentMask,
        version: WorldVersion,
        bus: &EventBus,
    ) -> u32 {
        let slot = self.size as usize;

        let entity_ptr = self.entities.insert_ptr(slot) as *mut Entity;
        unsafe { std::ptr::write(entity_ptr, entity) };

        for column in 0..self.columns.len() {
            let ptr = self.columns[column].insert_ptr(slot);
            let op = &self.ops.columns[column];
            if skip_ctor.has(op.id) {
                continue;
            }
            if let Some(ctor) = op.functions.ctor {
                unsafe { ctor(ptr, entity) };
            }
            if let Some(after_assign) = op.functions.after_assign {
                unsafe { after_assign(ptr, entity, bus) };
            }
        }

        self.size += 1;
        self.versions.ensure_slot(slot);
        self.versions
            .stamp_chunk(version, self.versions.chunk_at(slot));
        slot as u32
    }

    /// Move the entity at `src_slot` of `src` into this archetype.
    ///
    /// Columns present in both archetypes relocate bitwise; columns new to
    /// the destination default-construct unless masked by `skip_init`. The
    /// source slot is then swap-removed with the moved columns' lifetimes
    /// left alone. Returns the new slot and the entity that filled the
    /// source hole, if any.
    pub(crate) fn external_move(
        &mut self,
        entity: Entity,
        src: &mut Archetype,
        src_slot: u32,
        skip_init: &ComponentMask,
        version: WorldVersion,
        bus: &EventBus,
    ) -> (u32, Option<Entity>) {
        let slot = self.size as usize;

        let entity_ptr = self.entities.insert_ptr(slot) as *mut Entity;
        unsafe { std::ptr::write(entity_ptr, entity) };

        let mut moved = ComponentMask::new();
        for column in 0..self.columns.len() {
            let ptr = self.columns[column].insert_ptr(slot);
            let op = &self.ops.columns[column];
            if let Some(src_index) = src.component_index(op.id) {
                // identical column in both: relocate, never reconstruct
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        src.columns[src_index].slot_ptr(src_slot as usize),
                        ptr,
                        op.size,
                    );
                }
                moved.set(op.id, true);
                continue;
            }
            if skip_init.has(op.id) {
                continue;
            }
            if let Some(ctor) = op.functions.ctor {
                unsafe { ctor(ptr, entity) };
            }
            if let Some(after_assign) = op.functions.after_assign {
                unsafe { after_assign(ptr, entity, bus) };
            }
        }

        self.size += 1;
        self.versions.ensure_slot(slot);
        self.versions
            .stamp_chunk(version, self.versions.chunk_at(slot));

        let swapped = src.remove_inner(src_slot, &moved, version, bus);
        (slot as u32, swapped)
    }

    /// Swap-remove the entity at `slot`.
    ///
    /// Before-remove hooks and destructors run for every column not in
    /// `skip`; a column in `skip` had its value relocated elsewhere, so its
    /// lifetime is not ended here. If the removed slot was not the last, the
    /// last slot's values are relocated into the hole and the displaced
    /// entity is returned so the caller can fix its location.
    pub(crate) fn remove(
        &mut self,
        slot: u32,
        skip: &ComponentMask,
        version: WorldVersion,
        bus: &EventBus,
    ) -> Option<Entity> {
        self.remove_inner(slot, skip, version, bus)
    }

    fn remove_inner(
        &mut self,
        slot: u32,
        skip: &ComponentMask,
        version: WorldVersion,
        bus: &EventBus,
    ) -> Option<Entity> {
        debug_assert!(slot < self.size);
        let entity = self.entity_at(slot);

        for &column in &self.ops.before_remove_list {
            let op = &self.ops.columns[column];
            if skip.has(op.id) {
                continue;
            }
            let ptr = self.columns[column].slot_ptr(slot as usize);
            unsafe { (op.functions.before_remove.unwrap())(ptr, entity, bus) };
        }
        for &column in &self.ops.dtor_list {
            let op = &self.ops.columns[column];
            if skip.has(op.id) {
                continue;
            }
            let ptr = self.columns[column].slot_ptr(slot as usize);
            unsafe { (op.functions.dtor.unwrap())(ptr) };
        }

        let last = self.size - 1;
        let swapped = if slot != last {
            // fill the hole with the last slot, bitwise
            for column in 0..self.columns.len() {
                let size = self.ops.columns[column].size;
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        self.columns[column].slot_ptr(last as usize),
                        self.columns[column].slot_ptr(slot as usize),
                        size,
                    );
                }
            }
            let moved_entity = self.entity_at(last);
            unsafe {
                std::ptr::write(self.entities.slot_ptr(slot as usize) as *mut Entity, moved_entity)
            };
            Some(moved_entity)
        } else {
            None
        };

        self.size -= 1;
        let new_size = self.size as usize;
        self.entities.note_removed(new_size);
        for column in &mut self.columns {
            column.note_removed(new_size);
        }

        self.versions
            .stamp_chunk(version, self.versions.chunk_at(slot as usize));
        if slot != last {
            self.versions
                .stamp_chunk(version, self.versions.chunk_at(last as usize));
        }
        swapped
    }

    /// Run destructors for every live slot and reset size to zero. Buffers
    /// are kept: a drained archetype re-fills without reallocating.
    pub(crate) fn clear(&mut self) {
        for &column in &self.ops.dtor_list {
            let dtor = self.ops.columns[column].functions.dtor.unwrap();
            for slot in 0..self.size as usize {
                unsafe { dtor(self.columns[column].slot_ptr(slot)) };
            }
        }
        self.size = 0;
        self.entities.note_cleared();
        for column in &mut self.columns {
            column.note_cleared();
        }
    }
}

impl Drop for Archetype {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{Component, TypeDescriptor};
    use crate::registry;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    static LIVE: AtomicUsize = AtomicUsize::new(0);

    struct Counted(#[allow(dead_code)] u64);
    impl Counted {
        fn new(v: u64) -> Self {
            LIVE.fetch_add(1, Ordering::SeqCst);
            Self(v)
        }
    }
    impl Drop for Counted {
        fn drop(&mut self) {
            LIVE.fetch_sub(1, Ordering::SeqCst);
        }
    }
    impl Component for Counted {}

    // separate counter: tests run concurrently
    static LIVE2: AtomicUsize = AtomicUsize::new(0);

    struct Counted2(#[allow(dead_code)] u64);
    impl Counted2 {
        fn new(v: u64) -> Self {
            LIVE2.fetch_add(1, Ordering::SeqCst);
            Self(v)
        }
    }
    impl Drop for Counted2 {
        fn drop(&mut self) {
            LIVE2.fetch_sub(1, Ordering::SeqCst);
        }
    }
    impl Component for Counted2 {}

    #[derive(Default, Clone, Copy, PartialEq, Debug)]
    struct Value(i64);
    impl Component for Value {
        fn descriptor() -> TypeDescriptor {
            TypeDescriptor::builder::<Self>().with_default().finish()
        }
    }

    fn bus() -> Arc<EventBus> {
        Arc::new(EventBus::new())
    }

    fn entity(id: u32) -> Entity {
        Entity::new(id, 0, 0)
    }

    fn archetype_of(ids: &[ComponentId]) -> Archetype {
        Archetype::new(
            0,
            ComponentMask::from_ids(ids),
            SharedComponentsInfo::new(),
            4,
            &ComponentMask::all(),
        )
    }

    #[test]
    fn test_insert_constructs_and_stamps() {
        let value_id = registry::register_component::<Value>();
        let bus = bus();
        let mut arch = archetype_of(&[value_id]);

        let version = WorldVersion::new(3);
        let slot = arch.insert(entity(1), &ComponentMask::new(), version, &bus);
        assert_eq!(slot, 0);
        assert_eq!(arch.size(), 1);
        assert_eq!(arch.entity_at(0), entity(1));

        let ci = arch.component_index(value_id).unwrap();
        let v = unsafe { *(arch.const_component_ptr(ci, 0) as *const Value) };
        assert_eq!(v, Value(0)); // default-constructed
        assert_eq!(arch.global_component_version(ci), version);
        assert_eq!(arch.chunk_component_version(0, ci), version);
    }

    #[test]
    fn test_skip_ctor_mask() {
        let value_id = registry::register_component::<Value>();
        let bus = bus();
        let mut arch = archetype_of(&[value_id]);

        let skip = ComponentMask::from_ids(&[value_id]);
        let slot = arch.insert(entity(1), &skip, WorldVersion::new(1), &bus);
        // contents undefined; write before read
        let ci = arch.component_index(value_id).unwrap();
        let ptr = arch.component_ptr_mut(ci, slot, WorldVersion::new(1)) as *mut Value;
        unsafe { std::ptr::write(ptr, Value(42)) };
        let v = unsafe { *(arch.const_component_ptr(ci, slot) as *const Value) };
        assert_eq!(v, Value(42));
    }

    #[test]
    fn test_swap_remove_runs_destructors() {
        let counted_id = registry::register_component::<Counted>();
        let bus = bus();
        let mut arch = archetype_of(&[counted_id]);
        let ci = arch.component_index(counted_id).unwrap();

        let base = LIVE.load(Ordering::SeqCst);
        let skip = ComponentMask::from_ids(&[counted_id]);
        for i in 0..5 {
            let slot = arch.insert(entity(i), &skip, WorldVersion::new(1), &bus);
            let ptr = arch.component_ptr_silent(ci, slot) as *mut Counted;
            unsafe { std::ptr::write(ptr, Counted::new(i as u64)) };
        }
        assert_eq!(LIVE.load(Ordering::SeqCst), base + 5);

        // removing slot 1 destroys exactly one value and moves entity 4 in
        let swapped = arch.remove(1, &ComponentMask::new(), WorldVersion::new(2), &bus);
        assert_eq!(swapped, Some(entity(4)));
        assert_eq!(arch.entity_at(1), entity(4));
        assert_eq!(arch.size(), 4);
        assert_eq!(LIVE.load(Ordering::SeqCst), base + 4);

        // removing the last slot destructs in place, nothing to swap
        let swapped = arch.remove(3, &ComponentMask::new(), WorldVersion::new(2), &bus);
        assert_eq!(swapped, None);
        assert_eq!(LIVE.load(Ordering::SeqCst), base + 3);

        arch.clear();
        assert_eq!(LIVE.load(Ordering::SeqCst), base);
        assert_eq!(arch.size(), 0);
    }

    #[test]
    fn test_clear_then_refill() {
        let value_id = registry::register_component::<Value>();
        let bus = bus();
        let mut arch = archetype_of(&[value_id]);
        for i in 0..10 {
            arch.insert(entity(i), &ComponentMask::new(), WorldVersion::new(1), &bus);
        }
        arch.clear();
        assert!(arch.is_empty());
        let slot = arch.insert(entity(99), &ComponentMask::new(), WorldVersion::new(2), &bus);
        assert_eq!(slot, 0);
        assert_eq!(arch.entity_at(0), entity(99));
    }

    #[test]
    fn test_external_move_carries_values() {
        let value_id = registry::register_component::<Value>();
        let counted_id = registry::register_component::<Counted2>();
        let bus = bus();
        let mut src = archetype_of(&[value_id]);
        let mut dst = archetype_of(&[value_id, counted_id]);

        let sci = src.component_index(value_id).unwrap();
        let slot = src.insert(entity(7), &ComponentMask::new(), WorldVersion::new(1), &bus);
        unsafe {
            std::ptr::write(src.component_ptr_silent(sci, slot) as *mut Value, Value(123));
        }

        let base = LIVE2.load(Ordering::SeqCst);
        let skip_counted = ComponentMask::from_ids(&[counted_id]);
        let (new_slot, swapped) =
            dst.external_move(entity(7), &mut src, slot, &skip_counted, WorldVersion::new(2), &bus);
        assert_eq!(swapped, None);
        assert_eq!(src.size(), 0);
        assert_eq!(dst.size(), 1);
        // the skipped column was not constructed
        assert_eq!(LIVE2.load(Ordering::SeqCst), base);

        let dci = dst.component_index(value_id).unwrap();
        let v = unsafe { *(dst.const_component_ptr(dci, new_slot) as *const Value) };
        assert_eq!(v, Value(123));

        // write the skipped column before anything reads it
        let cci = dst.component_index(counted_id).unwrap();
        unsafe {
            std::ptr::write(
                dst.component_ptr_silent(cci, new_slot) as *mut Counted2,
                Counted2::new(1),
            );
        }
        dst.clear();
        assert_eq!(LIVE2.load(Ordering::SeqCst), base);
    }

    #[test]
    fn test_chunk_capacity_one() {
        let value_id = registry::register_component::<Value>();
        let bus = bus();
        let mut arch = Archetype::new(
            0,
            ComponentMask::from_ids(&[value_id]),
            SharedComponentsInfo::new(),
            1,
            &ComponentMask::all(),
        );
        for i in 0..50 {
            arch.insert(entity(i), &ComponentMask::new(), WorldVersion::new(1), &bus);
        }
        assert_eq!(arch.size(), 50);
        assert_eq!(arch.last_chunk_index(), 49);
        for i in 0..50 {
            assert_eq!(arch.entity_at(i).id(), i);
        }
    }
}
