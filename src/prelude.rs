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

//! Commonly used types in one import.

pub use crate::component::{Component, ComponentId, SharedComponentId, TypeDescriptor};
pub use crate::dispatcher::Dispatcher;
pub use crate::entity::Entity;
pub use crate::error::{EcsError, Result};
pub use crate::event::EventBus;
pub use crate::job::{Access, ArrayView, ComponentRequest, Job, JobContext, JobRunner, RunMode};
pub use crate::manager::EntityManager;
pub use crate::mask::ComponentMask;
pub use crate::registry;
pub use crate::shared::SharedComponent;
pub use crate::version::WorldVersion;
pub use crate::world::World;
