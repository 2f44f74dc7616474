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

//! Component descriptors and lifecycle hooks.
//!
//! A component is a plain value. The registry records, per component type, a
//! [`TypeDescriptor`]: name, size, alignment and a flat record of optional
//! lifecycle hooks. A hook left as `None` is trivial; the archetype operation
//! table branches on that once per column rather than once per element.
//!
//! Relocation between archetypes is a bitwise copy (a Rust move), so the
//! descriptor carries no move hooks.

use std::any::type_name;
use std::marker::PhantomData;

use ahash::AHashMap;

use crate::entity::Entity;
use crate::event::{ComponentAssigned, ComponentRemoved, EventBus};

/// Dense id of a unique component type (process-wide, never reused)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComponentId(u32);

impl ComponentId {
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    pub const fn index(self) -> u32 {
        self.0
    }
}

/// Dense id of a shared component type.
///
/// Shared and unique components occupy disjoint id spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SharedComponentId(u32);

impl SharedComponentId {
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    pub const fn index(self) -> u32 {
        self.0
    }
}

/// Default-construct the value at `ptr` for `entity`
pub type CtorFn = unsafe fn(*mut u8, Entity);
/// Drop the value at `ptr` in place
pub type DropFn = unsafe fn(*mut u8);
/// Clone-construct `src` into uninitialized `dst`
pub type CopyFn = unsafe fn(*mut u8, *const u8);
/// Value equality of two instances
pub type EqFn = unsafe fn(*const u8, *const u8) -> bool;
/// after-assign / before-remove notification
pub type HookFn = unsafe fn(*mut u8, Entity, &EventBus);
/// Clone `src` (owned by `src_entity`) into uninitialized `dst` (owned by
/// `dst_entity`), remapping embedded entity handles through the map
pub type CloneFn = unsafe fn(*mut u8, Entity, *const u8, Entity, &EntityRemap);

/// Flat record of optional lifecycle hooks
#[derive(Debug, Clone, Copy, Default)]
pub struct FunctionSet {
    pub ctor: Option<CtorFn>,
    pub dtor: Option<DropFn>,
    pub copy: Option<CopyFn>,
    pub eq: Option<EqFn>,
    pub after_assign: Option<HookFn>,
    pub before_remove: Option<HookFn>,
    pub clone_fn: Option<CloneFn>,
    pub after_clone: Option<CloneFn>,
}

/// Everything the storage engine needs to know about a component type.
#[derive(Debug, Clone)]
pub struct TypeDescriptor {
    pub name: String,
    pub size: usize,
    pub align: usize,
    pub functions: FunctionSet,
}

impl TypeDescriptor {
    /// Minimal descriptor: size, alignment, drop when needed.
    pub fn of<T: 'static>() -> Self {
        Self {
            name: type_name::<T>().to_string(),
            size: std::mem::size_of::<T>(),
            align: std::mem::align_of::<T>(),
            functions: FunctionSet {
                dtor: drop_fn_of::<T>(),
                ..FunctionSet::default()
            },
        }
    }

    /// Typed builder for wiring optional hooks.
    pub fn builder<T: Component>() -> DescriptorBuilder<T> {
        DescriptorBuilder {
            desc: Self::of::<T>(),
            _marker: PhantomData,
        }
    }
}

pub(crate) fn drop_fn_of<T>() -> Option<DropFn> {
    if std::mem::needs_drop::<T>() {
        unsafe fn drop_shim<T>(ptr: *mut u8) {
            std::ptr::drop_in_place(ptr as *mut T);
        }
        Some(drop_shim::<T>)
    } else {
        None
    }
}

/// Marker trait for unique components.
///
/// The optional methods become `after_assign` / `before_remove` hooks when the
/// descriptor wires them via [`DescriptorBuilder::with_hooks`].
pub trait Component: Send + Sync + 'static {
    fn after_assign(&mut self, _entity: Entity, _bus: &EventBus) {}
    fn before_remove(&mut self, _entity: Entity, _bus: &EventBus) {}

    /// Descriptor used by typed registration. Override to add hooks:
    ///
    /// ```ignore
    /// impl Component for Health {
    ///     fn descriptor() -> TypeDescriptor {
    ///         TypeDescriptor::builder::<Self>().with_default().finish()
    ///     }
    /// }
    /// ```
    fn descriptor() -> TypeDescriptor
    where
        Self: Sized,
    {
        TypeDescriptor::builder::<Self>().finish()
    }
}

/// Builder attaching optional hooks to a [`TypeDescriptor`].
pub struct DescriptorBuilder<T> {
    desc: TypeDescriptor,
    _marker: PhantomData<T>,
}

impl<T: Component> DescriptorBuilder<T> {
    /// Wire the default-construct hook from `T: Default`
    pub fn with_default(mut self) -> Self
    where
        T: Default,
    {
        unsafe fn ctor_shim<T: Default>(ptr: *mut u8, _entity: Entity) {
            std::ptr::write(ptr as *mut T, T::default());
        }
        self.desc.functions.ctor = Some(ctor_shim::<T>);
        self
    }

    /// Wire the copy-construct hook from `T: Clone`
    pub fn with_clone(mut self) -> Self
    where
        T: Clone,
    {
        unsafe fn copy_shim<T: Clone>(dst: *mut u8, src: *const u8) {
            std::ptr::write(dst as *mut T, (*(src as *const T)).clone());
        }
        self.desc.functions.copy = Some(copy_shim::<T>);
        self
    }

    /// Wire the equality hook from `T: PartialEq`
    pub fn with_equality(mut self) -> Self
    where
        T: PartialEq,
    {
        unsafe fn eq_shim<T: PartialEq>(a: *const u8, b: *const u8) -> bool {
            *(a as *const T) == *(b as *const T)
        }
        self.desc.functions.eq = Some(eq_shim::<T>);
        self
    }

    /// Wire `T::after_assign` / `T::before_remove` as hooks
    pub fn with_hooks(mut self) -> Self {
        unsafe fn after_shim<T: Component>(ptr: *mut u8, entity: Entity, bus: &EventBus) {
            (*(ptr as *mut T)).after_assign(entity, bus);
        }
        unsafe fn before_shim<T: Component>(ptr: *mut u8, entity: Entity, bus: &EventBus) {
            (*(ptr as *mut T)).before_remove(entity, bus);
        }
        self.desc.functions.after_assign = Some(after_shim::<T>);
        self.desc.functions.before_remove = Some(before_shim::<T>);
        self
    }

    /// Wire hooks posting the standard [`ComponentAssigned`] /
    /// [`ComponentRemoved`] events for this component.
    pub fn with_assign_events(mut self, id_of: fn() -> ComponentId) -> Self {
        // the id is resolved lazily: the descriptor is built before the
        // registry hands out the id
        unsafe fn assign_shim<T: Component>(_ptr: *mut u8, entity: Entity, bus: &EventBus) {
            bus.post(&ComponentAssigned {
                entity,
                component: assign_event_id::<T>(),
            });
        }
        unsafe fn remove_shim<T: Component>(_ptr: *mut u8, entity: Entity, bus: &EventBus) {
            bus.post(&ComponentRemoved {
                entity,
                component: assign_event_id::<T>(),
            });
        }
        set_assign_event_id::<T>(id_of);
        self.desc.functions.after_assign = Some(assign_shim::<T>);
        self.desc.functions.before_remove = Some(remove_shim::<T>);
        self
    }

    /// Wire the clone hook from `T: Clone` (no handle remapping)
    pub fn with_plain_clone(mut self) -> Self
    where
        T: Clone,
    {
        unsafe fn clone_shim<T: Clone>(
            dst: *mut u8,
            _dst_entity: Entity,
            src: *const u8,
            _src_entity: Entity,
            _map: &EntityRemap,
        ) {
            std::ptr::write(dst as *mut T, (*(src as *const T)).clone());
        }
        self.desc.functions.clone_fn = Some(clone_shim::<T>);
        self
    }

    /// Install a custom clone hook (handle-remapping components)
    pub fn with_clone_fn(mut self, f: CloneFn) -> Self {
        self.desc.functions.clone_fn = Some(f);
        self
    }

    /// Install a custom after-clone hook
    pub fn with_after_clone(mut self, f: CloneFn) -> Self {
        self.desc.functions.after_clone = Some(f);
        self
    }

    pub fn finish(self) -> TypeDescriptor {
        self.desc
    }
}

// Lazily resolved component ids for the standard assign/remove event shims.
// Plain fn pointers cannot capture the id, so it is parked per type.
use std::any::TypeId;
use std::sync::OnceLock;

use parking_lot::RwLock;

static ASSIGN_EVENT_TABLE: OnceLock<RwLock<AHashMap<TypeId, fn() -> ComponentId>>> =
    OnceLock::new();

fn set_assign_event_id<T: 'static>(id_of: fn() -> ComponentId) {
    let table = ASSIGN_EVENT_TABLE.get_or_init(Default::default);
    table.write().insert(TypeId::of::<T>(), id_of);
}

fn assign_event_id<T: 'static>() -> ComponentId {
    let table = ASSIGN_EVENT_TABLE.get_or_init(Default::default);
    let id_of = *table
        .read()
        .get(&TypeId::of::<T>())
        .expect("assign-event id requested before descriptor registration");
    id_of()
}

/// Handle translation map used by clone hooks (see the clone hook contract):
/// components embedding entity handles look their targets up here; a missing
/// entry means "point at the original".
#[derive(Debug, Default)]
pub struct EntityRemap {
    map: AHashMap<Entity, Entity>,
}

impl EntityRemap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, from: Entity, to: Entity) {
        self.map.insert(from, to);
    }

    /// Translated handle, or the original when no entry exists
    pub fn remap(&self, entity: Entity) -> Entity {
        self.map.get(&entity).copied().unwrap_or(entity)
    }
}
