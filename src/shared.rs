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

//! Shared (flyweight) components.
//!
//! A shared component is an immutable value interned by equality: all entities
//! binding the same value reference one `Arc` and live in the same archetype
//! variant. Because the entity manager interns values before they reach an
//! archetype, pointer identity equals value identity everywhere downstream.

use std::any::Any;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::component::SharedComponentId;
use crate::mask::ComponentMask;

/// Marker trait for shared component types.
///
/// Equality is mandatory: it drives interning.
pub trait SharedComponent: Send + Sync + PartialEq + Sized + 'static {}

/// Type-erased shared value with downcast and equality
pub trait SharedValue: Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;
    fn eq_value(&self, other: &dyn SharedValue) -> bool;
}

impl std::fmt::Debug for dyn SharedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<shared value>")
    }
}

impl<T: SharedComponent> SharedValue for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn eq_value(&self, other: &dyn SharedValue) -> bool {
        match other.as_any().downcast_ref::<T>() {
            Some(other) => self == other,
            None => false,
        }
    }
}

/// Reference-counted interned shared value
pub type SharedPtr = Arc<dyn SharedValue>;

fn thin_ptr(ptr: &SharedPtr) -> usize {
    Arc::as_ptr(ptr) as *const () as usize
}

/// The shared-component bindings of one archetype: a sorted list of
/// `(shared id, interned value)` pairs.
///
/// Equality and hashing use pointer identity, which interning makes
/// equivalent to value identity.
#[derive(Clone, Default)]
pub struct SharedComponentsInfo {
    items: SmallVec<[(SharedComponentId, SharedPtr); 2]>,
}

impl SharedComponentsInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Bind `value` to `id`, replacing any previous binding
    pub fn add(&mut self, id: SharedComponentId, value: SharedPtr) {
        match self.items.binary_search_by_key(&id, |(i, _)| *i) {
            Ok(pos) => self.items[pos].1 = value,
            Err(pos) => self.items.insert(pos, (id, value)),
        }
    }

    pub fn remove(&mut self, id: SharedComponentId) -> bool {
        match self.items.binary_search_by_key(&id, |(i, _)| *i) {
            Ok(pos) => {
                self.items.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    pub fn get(&self, id: SharedComponentId) -> Option<&SharedPtr> {
        self.items
            .binary_search_by_key(&id, |(i, _)| *i)
            .ok()
            .map(|pos| &self.items[pos].1)
    }

    pub fn has(&self, id: SharedComponentId) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(SharedComponentId, SharedPtr)> {
        self.items.iter()
    }

    /// Mask over the shared id space
    pub fn mask(&self) -> ComponentMask {
        let mut mask = ComponentMask::new();
        for (id, _) in &self.items {
            mask.set(crate::component::ComponentId::new(id.index()), true);
        }
        mask
    }

    /// Entries of `self`, with missing ids filled in from `other`
    pub fn merge(&self, other: &Self) -> Self {
        let mut result = other.clone();
        for (id, ptr) in &self.items {
            result.add(*id, ptr.clone());
        }
        result
    }
}

impl PartialEq for SharedComponentsInfo {
    fn eq(&self, other: &Self) -> bool {
        self.items.len() == other.items.len()
            && self
                .items
                .iter()
                .zip(other.items.iter())
                .all(|((ia, pa), (ib, pb))| ia == ib && Arc::ptr_eq(pa, pb))
    }
}

impl Eq for SharedComponentsInfo {}

impl std::hash::Hash for SharedComponentsInfo {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        for (id, ptr) in &self.items {
            id.hash(state);
            thin_ptr(ptr).hash(state);
        }
    }
}

impl std::fmt::Debug for SharedComponentsInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.items.iter().map(|(id, _)| id))
            .finish()
    }
}
