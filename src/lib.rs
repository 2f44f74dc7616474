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

//! Strata ECS - archetype-based entity component system runtime.
//!
//! Columnar chunked storage with stable-latency growth, generation-checked
//! entity handles, per-chunk change detection, a locked mode that buffers
//! structural mutation into per-thread logs, and a job engine dispatching
//! kernels over a fixed worker pool.

pub mod archetype;
pub mod component;
pub mod dispatcher;
pub mod entity;
pub mod error;
pub mod event;
pub mod filter;
pub mod job;
pub mod manager;
pub mod mask;
pub mod registry;
pub mod shared;
pub mod utils;
pub mod version;
pub mod world;

mod ops;
mod stable;
mod temporal;

// Re-exports for convenience
pub use archetype::Archetype;
pub use component::{Component, ComponentId, SharedComponentId, TypeDescriptor};
pub use dispatcher::Dispatcher;
pub use entity::{Entity, EntityLocation};
pub use error::{EcsError, Result};
pub use event::EventBus;
pub use filter::{EntityBlock, FilterParam, FilterResult};
pub use job::{Access, ArrayView, ComponentRequest, Job, JobContext, JobRunner, RunMode};
pub use manager::EntityManager;
pub use mask::ComponentMask;
pub use shared::{SharedComponent, SharedComponentsInfo, SharedPtr};
pub use version::WorldVersion;
pub use world::World;

pub mod prelude;
