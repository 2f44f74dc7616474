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

//! Process-global component registry.
//!
//! Component ids must agree across every world in the process, so the
//! registry is a single shared table with linearizable insertion: a
//! compare-and-insert on the descriptor name under one write lock.
//! The table is append-only; ids are dense and never reused. Unique and
//! shared components occupy disjoint id spaces.

use std::any::TypeId;

use ahash::AHashMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::component::{Component, ComponentId, SharedComponentId, TypeDescriptor};
use crate::error::{EcsError, Result};
use crate::mask::ComponentMask;
use crate::shared::SharedComponent;

#[derive(Default)]
struct Registry {
    unique: Vec<TypeDescriptor>,
    unique_by_name: AHashMap<String, ComponentId>,
    unique_by_type: AHashMap<TypeId, ComponentId>,

    shared: Vec<TypeDescriptor>,
    shared_by_name: AHashMap<String, SharedComponentId>,
    shared_by_type: AHashMap<TypeId, SharedComponentId>,
}

static REGISTRY: Lazy<RwLock<Registry>> = Lazy::new(Default::default);

/// Register a unique component by descriptor. Idempotent by name.
pub fn register(descriptor: TypeDescriptor) -> ComponentId {
    {
        let registry = REGISTRY.read();
        if let Some(&id) = registry.unique_by_name.get(&descriptor.name) {
            return id;
        }
    }
    let mut registry = REGISTRY.write();
    if let Some(&id) = registry.unique_by_name.get(&descriptor.name) {
        return id; // lost the race; first registration wins
    }
    let id = ComponentId::new(registry.unique.len() as u32);
    registry.unique_by_name.insert(descriptor.name.clone(), id);
    registry.unique.push(descriptor);
    id
}

/// Register a unique component type. Memoized per `TypeId`.
pub fn register_component<T: Component>() -> ComponentId {
    {
        let registry = REGISTRY.read();
        if let Some(&id) = registry.unique_by_type.get(&TypeId::of::<T>()) {
            return id;
        }
    }
    let descriptor = T::descriptor();
    let id = register(descriptor);
    REGISTRY.write().unique_by_type.insert(TypeId::of::<T>(), id);
    id
}

/// Register a shared component by descriptor.
///
/// The equality hook is mandatory (it drives interning).
pub fn register_shared(descriptor: TypeDescriptor) -> Result<SharedComponentId> {
    if descriptor.functions.eq.is_none() {
        return Err(EcsError::MissingHook {
            component: descriptor.name,
            hook: "eq",
        });
    }
    {
        let registry = REGISTRY.read();
        if let Some(&id) = registry.shared_by_name.get(&descriptor.name) {
            return Ok(id);
        }
    }
    let mut registry = REGISTRY.write();
    if let Some(&id) = registry.shared_by_name.get(&descriptor.name) {
        return Ok(id);
    }
    let id = SharedComponentId::new(registry.shared.len() as u32);
    registry.shared_by_name.insert(descriptor.name.clone(), id);
    registry.shared.push(descriptor);
    Ok(id)
}

/// Register a shared component type. Memoized per `TypeId`.
pub fn register_shared_component<T: SharedComponent>() -> SharedComponentId {
    {
        let registry = REGISTRY.read();
        if let Some(&id) = registry.shared_by_type.get(&TypeId::of::<T>()) {
            return id;
        }
    }
    let descriptor = shared_descriptor::<T>();
    // equality is wired below, so registration cannot fail
    let id = register_shared(descriptor).expect("shared descriptor carries eq");
    REGISTRY.write().shared_by_type.insert(TypeId::of::<T>(), id);
    id
}

fn shared_descriptor<T: SharedComponent>() -> TypeDescriptor {
    unsafe fn eq_shim<T: PartialEq>(a: *const u8, b: *const u8) -> bool {
        *(a as *const T) == *(b as *const T)
    }
    let mut descriptor = TypeDescriptor::of::<T>();
    descriptor.functions.eq = Some(eq_shim::<T>);
    descriptor
}

/// Clone of the descriptor for `id`. Total ordering by id; panics on an id
/// that was never handed out.
pub fn component_info(id: ComponentId) -> TypeDescriptor {
    REGISTRY.read().unique[id.index() as usize].clone()
}

/// Access the descriptor without cloning
pub fn with_component_info<R>(id: ComponentId, f: impl FnOnce(&TypeDescriptor) -> R) -> R {
    f(&REGISTRY.read().unique[id.index() as usize])
}

pub fn shared_component_info(id: SharedComponentId) -> TypeDescriptor {
    REGISTRY.read().shared[id.index() as usize].clone()
}

/// Number of unique components registered so far
pub fn component_count() -> usize {
    REGISTRY.read().unique.len()
}

/// Build a mask from component ids
pub fn mask_of(ids: &[ComponentId]) -> ComponentMask {
    ComponentMask::from_ids(ids)
}
