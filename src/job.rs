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

//! Job engine: kernel dispatch over filtered archetypes.
//!
//! A job declares its component accesses; the engine filters archetypes
//! (for change detection the job's last-run version is the check version and
//! the current world version stamps the write mask), partitions the selected
//! entities across tasks and walks each task's share as *arrays*: slices
//! that are contiguous in memory and cross neither chunk, block nor
//! dual-buffer migration boundaries. The kernel sees per-column base
//! pointers plus a length.
//!
//! The entity manager is locked before the first dispatch and unlocked
//! after every task joined, so kernels may create, assign, remove and
//! destroy through the [`JobContext`]: those calls land in the calling
//! thread's temporal log and replay at unlock. A running job cannot be
//! cancelled.

use std::time::Instant;

use crossbeam::sync::WaitGroup;
use smallvec::SmallVec;
use tracing::trace;

use crate::archetype::Archetype;
use crate::component::{Component, ComponentId, SharedComponentId};
use crate::entity::Entity;
use crate::error::Result;
use crate::filter::{FilterParam, FilterResult};
use crate::manager::EntityManager;
use crate::mask::ComponentMask;
use crate::registry;
use crate::shared::SharedComponent;
use crate::version::WorldVersion;
use crate::world::World;

/// How a job is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Partitioned across the worker pool; the submitter blocks until done
    Parallel,
    /// One task, executed on a pool worker
    SingleThread,
    /// One task, executed inline on the calling thread
    CurrentThread,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// One unique-component access of a job
#[derive(Debug, Clone, Copy)]
pub struct ComponentRequest {
    pub id: ComponentId,
    pub access: Access,
    pub required: bool,
}

impl ComponentRequest {
    pub fn read(id: ComponentId) -> Self {
        Self {
            id,
            access: Access::Read,
            required: true,
        }
    }

    pub fn write(id: ComponentId) -> Self {
        Self {
            id,
            access: Access::Write,
            required: true,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// One contiguous run of entities handed to the kernel.
pub struct ArrayView<'a> {
    entities: *const Entity,
    /// Base pointer per request; null when an optional component is absent
    columns: &'a [*mut u8],
    /// Interned payload per shared request; null when absent
    shared: &'a [*const u8],
    len: u32,
    first_index: u32,
}

impl ArrayView<'_> {
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Global invocation index of element 0 within this job run
    pub fn first_index(&self) -> u32 {
        self.first_index
    }

    pub fn entities(&self) -> &[Entity] {
        unsafe { std::slice::from_raw_parts(self.entities, self.len as usize) }
    }

    /// Base pointer of the column for request `index`, if present
    pub fn column(&self, index: usize) -> Option<*mut u8> {
        let ptr = self.columns[index];
        if ptr.is_null() {
            None
        } else {
            Some(ptr)
        }
    }

    /// Typed view of the column for request `index`.
    ///
    /// # Safety
    /// `T` must be the component type the request was built from.
    pub unsafe fn slice<T>(&self, index: usize) -> Option<&[T]> {
        self.column(index)
            .map(|ptr| std::slice::from_raw_parts(ptr as *const T, self.len as usize))
    }

    /// Typed mutable view of the column for request `index`.
    ///
    /// # Safety
    /// `T` must match the request's component type, and the request must be
    /// a write access (tasks only ever overlap on read columns).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut<T>(&self, index: usize) -> Option<&mut [T]> {
        self.column(index)
            .map(|ptr| std::slice::from_raw_parts_mut(ptr as *mut T, self.len as usize))
    }

    /// Shared component value for shared request `index`.
    ///
    /// # Safety
    /// `T` must be the shared component type the request was built from.
    pub unsafe fn shared<T>(&self, index: usize) -> Option<&T> {
        let ptr = self.shared[index];
        if ptr.is_null() {
            None
        } else {
            Some(&*(ptr as *const T))
        }
    }
}

/// Structural-mutation surface available to kernels while the manager is
/// locked.
///
/// Every method either reads the pre-lock snapshot or appends to the calling
/// thread's temporal log, so concurrent use from pool workers is safe; the
/// log replays when the job's unlock brings the lock count to zero.
pub struct JobContext {
    manager: *mut EntityManager,
    thread_id: u32,
}

unsafe impl Send for JobContext {}
unsafe impl Sync for JobContext {}

impl JobContext {
    /// Pool thread id running this task (0 for the submitter)
    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    fn manager(&self) -> &EntityManager {
        unsafe { &*self.manager }
    }

    // SAFETY (all &mut reconstructions below): the manager is locked for
    // the whole job, so these calls only touch the per-thread temporal log
    // and read pre-lock state; no two threads alias the same log slot.
    #[allow(clippy::mut_from_ref)]
    fn manager_mut(&self) -> &mut EntityManager {
        unsafe { &mut *self.manager }
    }

    /// Create a provisional entity (reconciled at unlock)
    pub fn create(&self) -> Entity {
        self.manager_mut().create()
    }

    pub fn destroy(&self, entity: Entity) {
        self.manager_mut().destroy(entity);
    }

    pub fn destroy_now(&self, entity: Entity) {
        self.manager_mut().destroy_now(entity);
    }

    /// Deferred assign; the value lives in the temporal log until unlock
    pub fn assign<T: Component>(&self, entity: Entity, value: T) -> Result<()> {
        let id = registry::register_component::<T>();
        let ptr = self.manager_mut().assign(entity, id, true)?;
        unsafe { std::ptr::write(ptr as *mut T, value) };
        Ok(())
    }

    pub fn remove<T: Component>(&self, entity: Entity) -> Result<()> {
        self.manager_mut().remove::<T>(entity)
    }

    /// Pre-lock snapshot read
    pub fn get<T: Component>(&self, entity: Entity) -> Option<&T> {
        self.manager().get::<T>(entity)
    }

    pub fn has<T: Component>(&self, entity: Entity) -> bool {
        self.manager().has::<T>(entity)
    }

    pub fn get_shared<T: SharedComponent>(&self, entity: Entity) -> Option<&T> {
        self.manager().get_shared::<T>(entity)
    }
}

/// A user kernel plus its access declarations.
///
/// `execute` is called once per array; requests index into
/// [`ArrayView::slice`] in declaration order, shared requests into
/// [`ArrayView::shared`].
pub trait Job: Send + Sync {
    fn name(&self) -> &str {
        "job"
    }

    fn requests(&self) -> Vec<ComponentRequest>;

    fn shared_requests(&self) -> Vec<SharedComponentId> {
        Vec::new()
    }

    /// Change-detection mask; empty means "visit everything"
    fn check_mask(&self) -> ComponentMask {
        ComponentMask::new()
    }

    /// Extra per-archetype rejection
    fn filter_archetype(&self, _archetype: &Archetype) -> bool {
        true
    }

    /// Extra per-chunk rejection
    fn filter_chunk(&self, _archetype: &Archetype, _chunk: usize) -> bool {
        true
    }

    fn execute(&self, view: &ArrayView<'_>, ctx: &JobContext);

    fn on_begin(&self, _total: u32, _tasks: u32) {}

    fn on_end(&self) {}
}

const CALIBRATION_RUNS: u32 = 4;
/// Throughput above this is considered memory-bound; arrays stay unbounded
const MEMORY_BOUND_BYTES_PER_NS: f64 = 8.0;
/// Byte budget a capped array should fit when the kernel is compute-bound
const CAPPED_ARRAY_BYTES: usize = 32 * 1024;

#[derive(Default)]
struct Calibration {
    runs: u32,
    bytes: u64,
    nanos: u64,
}

impl Calibration {
    fn record(&mut self, bytes: u64, nanos: u64) {
        if self.runs < CALIBRATION_RUNS {
            self.runs += 1;
            self.bytes += bytes;
            self.nanos += nanos.max(1);
        }
    }

    /// Array length cap, once calibrated and compute-bound
    fn array_cap(&self, max_component_size: usize) -> Option<u32> {
        if self.runs < CALIBRATION_RUNS {
            return None;
        }
        let rate = self.bytes as f64 / self.nanos as f64;
        if rate >= MEMORY_BOUND_BYTES_PER_NS {
            None
        } else {
            Some((CAPPED_ARRAY_BYTES / max_component_size.max(1)).clamp(1, 4096) as u32)
        }
    }
}

/// Per-archetype pointers resolved once per run
struct ArchetypePlan {
    /// Column index per request; -1 when an optional component is absent
    columns: SmallVec<[i32; 8]>,
    shared: SmallVec<[*const u8; 2]>,
    chunk_capacity: u32,
    /// Ascending slot indices where any column's dual-buffer storage breaks
    /// contiguity
    boundaries: SmallVec<[usize; 4]>,
}

/// Contiguous slice of the filtered sequence owned by one task
#[derive(Clone, Copy)]
struct TaskSlice {
    entry: usize,
    /// Offset into the entry's filtered sequence (concatenated blocks)
    offset: u32,
    size: u32,
    global_start: u32,
}

/// Owns a [`Job`] plus its change-detection and calibration state.
pub struct JobRunner<J: Job> {
    job: J,
    last_run: WorldVersion,
    calibration: Calibration,
}

impl<J: Job> JobRunner<J> {
    pub fn new(job: J) -> Self {
        Self {
            job,
            last_run: WorldVersion::NULL,
            calibration: Calibration::default(),
        }
    }

    pub fn job(&self) -> &J {
        &self.job
    }

    pub fn job_mut(&mut self) -> &mut J {
        &mut self.job
    }

    /// Filter, partition and execute. Returns the number of entities
    /// visited.
    pub fn run(&mut self, world: &mut World, mode: RunMode) -> u32 {
        let requests = self.job.requests();
        let shared_requests = self.job.shared_requests();

        let mut required = ComponentMask::new();
        let mut write_mask = ComponentMask::new();
        let mut bytes_per_entity = std::mem::size_of::<Entity>();
        let mut max_component_size = 1usize;
        for request in &requests {
            if request.required {
                required.set(request.id, true);
            }
            if request.access == Access::Write {
                write_mask.set(request.id, true);
            }
            let size = registry::with_component_info(request.id, |info| info.size);
            bytes_per_entity += size;
            max_component_size = max_component_size.max(size);
        }
        let mut required_shared = ComponentMask::new();
        for id in &shared_requests {
            required_shared.set(ComponentId::new(id.index()), true);
        }

        let current = world.entities().world_version();
        let mut result = FilterResult::new(required, required_shared);
        let job = &self.job;
        let archetype_filter = |archetype: &Archetype| job.filter_archetype(archetype);
        let chunk_filter = |archetype: &Archetype, chunk: usize| job.filter_chunk(archetype, chunk);
        let total = result.apply(
            world.entities_mut(),
            &FilterParam {
                mask: self.job.check_mask(),
                version: self.last_run,
            },
            &FilterParam {
                mask: write_mask,
                version: current,
            },
            Some(&archetype_filter),
            Some(&chunk_filter),
        );
        if total == 0 {
            return 0;
        }
        self.last_run = current;
        world.entities_mut().bump_version();

        let dispatcher = world.dispatcher().clone();
        let task_count = match mode {
            RunMode::Parallel => total.min(dispatcher.thread_count() + 1).max(1),
            _ => 1,
        };
        trace!(job = self.job.name(), total, task_count, "job dispatch");
        self.job.on_begin(total, task_count);

        let manager = world.entities_mut();
        manager.lock();

        // resolve column indices and shared payloads once per archetype
        let plans: Vec<ArchetypePlan> = result
            .entries
            .iter()
            .map(|entry| {
                let archetype = manager.archetype(entry.archetype);
                ArchetypePlan {
                    columns: requests
                        .iter()
                        .map(|r| archetype.component_index(r.id).map(|i| i as i32).unwrap_or(-1))
                        .collect(),
                    shared: shared_requests
                        .iter()
                        .map(|id| {
                            archetype
                                .shared_value_ptr(*id)
                                .unwrap_or(std::ptr::null())
                        })
                        .collect(),
                    chunk_capacity: archetype.chunk_capacity(),
                    boundaries: archetype.storage_boundaries(),
                }
            })
            .collect();

        let slices = partition(&result, total, task_count);
        let cap = self.calibration.array_cap(max_component_size);

        let started = Instant::now();
        match mode {
            RunMode::CurrentThread => {
                let ctx = JobContext {
                    manager: manager as *mut EntityManager,
                    thread_id: crate::dispatcher::current_thread_id(),
                };
                for slice in &slices {
                    walk_task(&self.job, &ctx, &result, &plans, *slice, cap);
                }
            }
            RunMode::Parallel | RunMode::SingleThread => {
                // SAFETY: every address below outlives the dispatch: the
                // wait group joins all tasks before this frame returns, and
                // the lock keeps archetype storage in place. Tasks write
                // only through disjoint (archetype, block) ranges.
                let job_addr = &self.job as *const J as usize;
                let manager_addr = manager as *mut EntityManager as usize;
                let result_addr = &result as *const FilterResult as usize;
                let plans_addr = plans.as_ptr() as usize;
                let plans_len = plans.len();

                let wait_group = WaitGroup::new();
                for slice in slices {
                    let wg = wait_group.clone();
                    dispatcher.add_parallel_task(move |thread_id| {
                        let job = unsafe { &*(job_addr as *const J) };
                        let result = unsafe { &*(result_addr as *const FilterResult) };
                        let plans = unsafe {
                            std::slice::from_raw_parts(plans_addr as *const ArchetypePlan, plans_len)
                        };
                        let ctx = JobContext {
                            manager: manager_addr as *mut EntityManager,
                            thread_id,
                        };
                        walk_task(job, &ctx, result, plans, slice, cap);
                        drop(wg);
                    });
                }
                wait_group.wait();
            }
        }
        let elapsed = started.elapsed().as_nanos() as u64;
        self.calibration
            .record(total as u64 * bytes_per_entity as u64, elapsed);

        world.entities_mut().unlock();
        self.job.on_end();
        total
    }
}

/// Split the filtered sequence into `task_count` near-equal slices; the
/// first `total % task_count` tasks carry one extra entity.
fn partition(result: &FilterResult, total: u32, task_count: u32) -> Vec<TaskSlice> {
    let per_task = total / task_count;
    let extra = total % task_count;

    let mut slices = Vec::with_capacity(task_count as usize);
    let mut entry = 0usize;
    let mut offset = 0u32;
    let mut global = 0u32;
    for task in 0..task_count {
        let size = per_task + u32::from(task < extra);
        slices.push(TaskSlice {
            entry,
            offset,
            size,
            global_start: global,
        });
        global += size;

        // advance the cursor across entries
        let mut remaining = size;
        while remaining > 0 {
            let available = result.entries[entry].count - offset;
            if available > remaining {
                offset += remaining;
                remaining = 0;
            } else {
                remaining -= available;
                entry += 1;
                offset = 0;
            }
        }
    }
    slices
}

/// Walk one task's slice of the filtered sequence, slicing arrays at block,
/// chunk, migration-boundary and calibration limits.
fn walk_task<J: Job>(
    job: &J,
    ctx: &JobContext,
    result: &FilterResult,
    plans: &[ArchetypePlan],
    slice: TaskSlice,
    cap: Option<u32>,
) {
    let manager = unsafe { &*(ctx.manager as *const EntityManager) };
    let mut entry_index = slice.entry;
    let mut skip = slice.offset;
    let mut remaining = slice.size;
    let mut global_index = slice.global_start;

    while remaining > 0 {
        let entry = &result.entries[entry_index];
        let plan = &plans[entry_index];
        let archetype = manager.archetype(entry.archetype);

        let mut local_skip = skip;
        for block in &entry.blocks {
            if remaining == 0 {
                break;
            }
            let block_len = block.len();
            if local_skip >= block_len {
                local_skip -= block_len;
                continue;
            }
            let mut begin = block.begin + local_skip;
            local_skip = 0;

            while begin < block.end && remaining > 0 {
                let mut end = block.end.min(begin + remaining);
                // arrays never cross a chunk boundary
                let chunk_end = (begin / plan.chunk_capacity + 1) * plan.chunk_capacity;
                end = end.min(chunk_end);
                // nor any column's dual-buffer migration boundary
                for &boundary in plan.boundaries.iter() {
                    if (begin as usize) < boundary && boundary < end as usize {
                        end = boundary as u32;
                        break;
                    }
                }
                // nor the calibrated batch cap
                if let Some(cap) = cap {
                    end = end.min(begin + cap);
                }

                let len = end - begin;
                let columns: SmallVec<[*mut u8; 8]> = plan
                    .columns
                    .iter()
                    .map(|&index| {
                        if index < 0 {
                            std::ptr::null_mut()
                        } else {
                            archetype.component_ptr_silent(index as usize, begin)
                        }
                    })
                    .collect();
                let view = ArrayView {
                    entities: archetype.entity_ptr(begin),
                    columns: &columns,
                    shared: &plan.shared,
                    len,
                    first_index: global_index,
                };
                job.execute(&view, ctx);

                begin = end;
                global_index += len;
                remaining -= len;
            }
        }

        skip = 0;
        entry_index += 1;
        if remaining > 0 && entry_index >= result.entries.len() {
            debug_assert!(false, "task slice exceeds filtered total");
            break;
        }
    }
}
