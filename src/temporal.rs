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

//! Temporal (deferred) mutation log.
//!
//! While the entity manager is locked, structural mutations are appended to a
//! per-thread log instead of touching archetypes. Assigned component payloads
//! live in a bump arena whose pointers stay valid until unlock; the arena's
//! recycled chunk survives `clear`, so steady-state logging does not
//! allocate.
//!
//! The log is drained by the entity manager when the lock count returns to
//! zero. Payloads that were never applied (the entity was destroyed first:
//! destroy wins, the assignment is dropped silently) have their destructors
//! run by `clear`.

use std::alloc::Layout;

use bumpalo::Bump;

use crate::component::{ComponentId, DropFn};
use crate::entity::Entity;
use crate::mask::ComponentMask;
use crate::registry;
use crate::shared::SharedComponentsInfo;

/// Mask and shared bindings of a deferred `create`
pub(crate) struct CreateInfo {
    pub mask: ComponentMask,
    pub shared: SharedComponentsInfo,
}

/// One logged mutation
pub(crate) enum Action {
    Create {
        entity: Entity,
        /// Index into the side table; `None` for an empty-archetype create
        info: Option<u32>,
    },
    Destroy {
        entity: Entity,
    },
    DestroyNow {
        entity: Entity,
    },
    Assign {
        entity: Entity,
        component: ComponentId,
        ptr: *mut u8,
        size: usize,
        dtor: Option<DropFn>,
        /// Cleared when the payload's bytes were relocated into an archetype
        live: bool,
    },
    Remove {
        entity: Entity,
        component: ComponentId,
    },
}

impl Action {
    pub fn entity(&self) -> Entity {
        match self {
            Action::Create { entity, .. }
            | Action::Destroy { entity }
            | Action::DestroyNow { entity }
            | Action::Assign { entity, .. }
            | Action::Remove { entity, .. } => *entity,
        }
    }
}

/// Per-thread deferred log: an action list plus a payload arena.
#[derive(Default)]
pub(crate) struct TemporalStorage {
    arena: Bump,
    actions: Vec<Action>,
    create_infos: Vec<CreateInfo>,
}

// Arena pointers are only dereferenced by the owning thread while locked and
// by the draining thread after all workers joined.
unsafe impl Send for TemporalStorage {}

impl TemporalStorage {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Log a create of a provisional entity
    pub fn create(&mut self, entity: Entity, mask: ComponentMask, shared: SharedComponentsInfo) {
        let info = if mask.is_empty() && shared.is_empty() {
            None
        } else {
            self.create_infos.push(CreateInfo { mask, shared });
            Some(self.create_infos.len() as u32 - 1)
        };
        self.actions.push(Action::Create { entity, info });
    }

    pub fn destroy(&mut self, entity: Entity) {
        self.actions.push(Action::Destroy { entity });
    }

    pub fn destroy_now(&mut self, entity: Entity) {
        self.actions.push(Action::DestroyNow { entity });
    }

    pub fn remove_component(&mut self, entity: Entity, component: ComponentId) {
        self.actions.push(Action::Remove { entity, component });
    }

    /// Log an assign and return the arena pointer the caller may write
    /// through until unlock.
    ///
    /// With `skip_ctor` the default-construct hook is not run and the caller
    /// must fully initialize the payload before unlock.
    pub fn assign_component(
        &mut self,
        entity: Entity,
        component: ComponentId,
        skip_ctor: bool,
    ) -> *mut u8 {
        let (size, align, ctor, dtor) = registry::with_component_info(component, |info| {
            (
                info.size,
                info.align,
                info.functions.ctor,
                info.functions.dtor,
            )
        });
        let layout =
            Layout::from_size_align(size.max(1), align.max(1)).expect("component layout overflow");
        let ptr = self.arena.alloc_layout(layout).as_ptr();
        if !skip_ctor {
            if let Some(ctor) = ctor {
                unsafe { ctor(ptr, entity) };
            }
        }
        self.actions.push(Action::Assign {
            entity,
            component,
            ptr,
            size,
            dtor,
            live: true,
        });
        ptr
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn actions_mut(&mut self) -> &mut [Action] {
        &mut self.actions
    }

    pub fn create_info(&self, index: u32) -> &CreateInfo {
        &self.create_infos[index as usize]
    }

    pub(crate) fn take_parts(&mut self) -> (Vec<Action>, Vec<CreateInfo>) {
        (
            std::mem::take(&mut self.actions),
            std::mem::take(&mut self.create_infos),
        )
    }

    /// Drop still-live payloads and recycle the arena (one chunk is kept).
    pub fn clear(&mut self) {
        for action in &self.actions {
            if let Action::Assign {
                ptr,
                dtor: Some(dtor),
                live: true,
                ..
            } = action
            {
                unsafe { dtor(*ptr) };
            }
        }
        self.actions.clear();
        self.create_infos.clear();
        self.arena.reset();
    }
}

impl Drop for TemporalStorage {
    fn drop(&mut self) {
        self.clear();
    }
}
