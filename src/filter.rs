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

//! Archetype and chunk selection.
//!
//! A filter pass walks archetypes in world order, rejects the ones that are
//! empty, fail the required masks or the user predicate, and applies the
//! `check_and_stamp` version primitive first at archetype granularity, then
//! per chunk. Runs of consecutive accepted chunks become half-open slot
//! blocks clipped to the archetype size.
//!
//! Given the same inputs and the same world state the output is
//! deterministic; blocks within an archetype are disjoint and sorted.

use smallvec::SmallVec;

use crate::archetype::Archetype;
use crate::manager::EntityManager;
use crate::mask::ComponentMask;
use crate::version::WorldVersion;

/// Mask + version pair for the check or set side of a filter
#[derive(Debug, Clone, Default)]
pub struct FilterParam {
    pub mask: ComponentMask,
    pub version: WorldVersion,
}

/// Half-open range of archetype slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityBlock {
    pub begin: u32,
    pub end: u32,
}

impl EntityBlock {
    pub fn len(&self) -> u32 {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.begin
    }
}

/// One selected archetype with its accepted blocks
#[derive(Debug, Clone)]
pub struct ArchetypeFilterEntry {
    pub archetype: u32,
    pub count: u32,
    pub blocks: SmallVec<[EntityBlock; 4]>,
}

impl ArchetypeFilterEntry {
    fn add_block(&mut self, block: EntityBlock) {
        if !block.is_empty() {
            self.count += block.len();
            self.blocks.push(block);
        }
    }
}

/// Result of one filter pass
#[derive(Default)]
pub struct FilterResult {
    pub required: ComponentMask,
    pub required_shared: ComponentMask,
    pub entries: Vec<ArchetypeFilterEntry>,
    pub total: u32,
}

impl FilterResult {
    pub fn new(required: ComponentMask, required_shared: ComponentMask) -> Self {
        Self {
            required,
            required_shared,
            entries: Vec::new(),
            total: 0,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.total = 0;
    }

    /// Run the filter over every archetype of `manager`.
    ///
    /// `check` decides acceptance (strictly-newer versions in the mask);
    /// `set` stamps accepted levels. Both masks are intersected with each
    /// archetype's own mask first. Returns the total selected entity count.
    pub fn apply(
        &mut self,
        manager: &mut EntityManager,
        check: &FilterParam,
        set: &FilterParam,
        archetype_filter: Option<&dyn Fn(&Archetype) -> bool>,
        chunk_filter: Option<&dyn Fn(&Archetype, usize) -> bool>,
    ) -> u32 {
        self.clear();

        for index in 0..manager.archetype_count() as u32 {
            let accepted = {
                let archetype = manager.archetype(index);
                archetype.size() > 0
                    && archetype.mask().is_match(&self.required)
                    && archetype.shared_info().mask().is_match(&self.required_shared)
                    && archetype_filter.map(|f| f(archetype)).unwrap_or(true)
            };
            if !accepted {
                continue;
            }

            let archetype = manager.archetype_mut(index);
            let archetype_check = archetype.version_param(&check.mask, check.version);
            let archetype_set = archetype.version_param(&set.mask, set.version);
            if !archetype
                .versions_mut()
                .check_and_stamp(&archetype_check, &archetype_set)
            {
                continue;
            }

            self.filter_chunks(index, manager, &archetype_check, &archetype_set, chunk_filter);
        }
        self.total
    }

    fn filter_chunks(
        &mut self,
        index: u32,
        manager: &mut EntityManager,
        check: &crate::version::VersionParam,
        set: &crate::version::VersionParam,
        chunk_filter: Option<&dyn Fn(&Archetype, usize) -> bool>,
    ) {
        let archetype = manager.archetype_mut(index);
        let size = archetype.size();
        let chunk_capacity = archetype.chunk_capacity() as u64;
        let last_chunk = archetype.last_chunk_index();

        let mut entry = ArchetypeFilterEntry {
            archetype: index,
            count: 0,
            blocks: SmallVec::new(),
        };
        let mut block = EntityBlock { begin: 0, end: 0 };
        let mut prev_matched = false;

        for chunk in 0..=last_chunk {
            let user_ok = match chunk_filter {
                Some(f) => f(archetype, chunk),
                None => true,
            };
            let matched = user_ok
                && archetype
                    .versions_mut()
                    .check_and_stamp_chunk(check, set, chunk);
            if matched {
                if !prev_matched {
                    block.begin = (chunk as u64 * chunk_capacity).min(u32::MAX as u64) as u32;
                }
                block.end = ((chunk as u64 + 1) * chunk_capacity).min(size as u64) as u32;
            } else if prev_matched {
                entry.add_block(block);
            }
            prev_matched = matched;
        }
        if prev_matched {
            block.end = block.end.min(size);
            entry.add_block(block);
        }

        if entry.count > 0 {
            self.total += entry.count;
            self.entries.push(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{Component, ComponentId, TypeDescriptor};
    use crate::event::EventBus;
    use crate::registry;
    use crate::shared::SharedComponentsInfo;
    use std::sync::Arc;

    #[derive(Default, Clone, Copy)]
    struct Pos(#[allow(dead_code)] f32);
    impl Component for Pos {
        fn descriptor() -> TypeDescriptor {
            TypeDescriptor::builder::<Self>().with_default().finish()
        }
    }

    #[derive(Default, Clone, Copy)]
    struct Vel(#[allow(dead_code)] f32);
    impl Component for Vel {
        fn descriptor() -> TypeDescriptor {
            TypeDescriptor::builder::<Self>().with_default().finish()
        }
    }

    fn manager() -> EntityManager {
        EntityManager::new(0, 0, Arc::new(EventBus::new()))
    }

    fn spawn(manager: &mut EntityManager, ids: &[ComponentId], n: usize) {
        let mask = ComponentMask::from_ids(ids);
        for _ in 0..n {
            manager
                .create_with(&mask, &SharedComponentsInfo::new())
                .unwrap();
        }
    }

    #[test]
    fn test_mask_matching_and_counts() {
        let pos = registry::register_component::<Pos>();
        let vel = registry::register_component::<Vel>();
        let mut manager = manager();
        spawn(&mut manager, &[pos], 10);
        spawn(&mut manager, &[pos, vel], 5);

        let mut result = FilterResult::new(ComponentMask::from_ids(&[pos]), ComponentMask::new());
        let total = result.apply(
            &mut manager,
            &FilterParam::default(),
            &FilterParam::default(),
            None,
            None,
        );
        assert_eq!(total, 15);

        let mut result =
            FilterResult::new(ComponentMask::from_ids(&[pos, vel]), ComponentMask::new());
        let total = result.apply(
            &mut manager,
            &FilterParam::default(),
            &FilterParam::default(),
            None,
            None,
        );
        assert_eq!(total, 5);
        assert_eq!(result.entries.len(), 1);
        let entry = &result.entries[0];
        assert_eq!(entry.count, 5);
        assert_eq!(entry.blocks.len(), 1);
        assert_eq!(entry.blocks[0], EntityBlock { begin: 0, end: 5 });
    }

    #[test]
    fn test_empty_archetypes_skipped() {
        let pos = registry::register_component::<Pos>();
        let mut manager = manager();
        let entity = manager
            .create_with(&ComponentMask::from_ids(&[pos]), &SharedComponentsInfo::new())
            .unwrap();
        manager.destroy_now(entity);

        let mut result = FilterResult::new(ComponentMask::from_ids(&[pos]), ComponentMask::new());
        let total = result.apply(
            &mut manager,
            &FilterParam::default(),
            &FilterParam::default(),
            None,
            None,
        );
        assert_eq!(total, 0);
        assert!(result.entries.is_empty());
    }

    #[test]
    fn test_version_check_skips_stale() {
        let pos = registry::register_component::<Pos>();
        let mut manager = manager();
        spawn(&mut manager, &[pos], 8);

        let check_mask = ComponentMask::from_ids(&[pos]);

        // first pass at the current version sees everything
        let version = manager.world_version();
        let mut result = FilterResult::new(check_mask.clone(), ComponentMask::new());
        let total = result.apply(
            &mut manager,
            &FilterParam {
                mask: check_mask.clone(),
                version: WorldVersion::NULL,
            },
            &FilterParam {
                mask: ComponentMask::new(),
                version,
            },
            None,
            None,
        );
        assert_eq!(total, 8);

        // second pass checking against the current version sees nothing new
        let mut result = FilterResult::new(check_mask.clone(), ComponentMask::new());
        let total = result.apply(
            &mut manager,
            &FilterParam {
                mask: check_mask.clone(),
                version,
            },
            &FilterParam {
                mask: ComponentMask::new(),
                version: version.next(),
            },
            None,
            None,
        );
        assert_eq!(total, 0);

        // a single mutation brings exactly one chunk back
        let entity = manager.archetype(1).entity_at(3);
        manager.bump_version();
        let touched = manager.get_mut::<Pos>(entity).is_some();
        assert!(touched);
        let set_version = manager.world_version().next();
        let mut result = FilterResult::new(check_mask.clone(), ComponentMask::new());
        let total = result.apply(
            &mut manager,
            &FilterParam {
                mask: check_mask,
                version,
            },
            &FilterParam {
                mask: ComponentMask::new(),
                version: set_version,
            },
            None,
            None,
        );
        assert_eq!(total, 8); // one chunk holds all 8 here
    }

    #[test]
    fn test_user_predicate() {
        let pos = registry::register_component::<Pos>();
        let vel = registry::register_component::<Vel>();
        let mut manager = manager();
        spawn(&mut manager, &[pos], 4);
        spawn(&mut manager, &[pos, vel], 4);

        let reject_vel = |archetype: &Archetype| !archetype.mask().has(vel);
        let mut result = FilterResult::new(ComponentMask::from_ids(&[pos]), ComponentMask::new());
        let total = result.apply(
            &mut manager,
            &FilterParam::default(),
            &FilterParam::default(),
            Some(&reject_vel),
            None,
        );
        assert_eq!(total, 4);
    }

    #[test]
    fn test_chunk_gaps_split_blocks() {
        let pos = registry::register_component::<Pos>();
        let mut manager = manager();
        // force 2-slot chunks so 6 entities span 3 chunks
        manager.add_chunk_size_for(ComponentMask::from_ids(&[pos]), 2, 2);
        spawn(&mut manager, &[pos], 6);

        let check_mask = ComponentMask::from_ids(&[pos]);
        let seeded = manager.world_version();

        // touch slots 0 and 5 (chunks 0 and 2)
        manager.bump_version();
        let arch_index = manager.archetype_of(manager.archetype(1).entity_at(0)).unwrap();
        let e0 = manager.archetype(arch_index).entity_at(0);
        let e5 = manager.archetype(arch_index).entity_at(5);
        manager.get_mut::<Pos>(e0);
        manager.get_mut::<Pos>(e5);

        let set_version = manager.world_version();
        let mut result = FilterResult::new(check_mask.clone(), ComponentMask::new());
        let total = result.apply(
            &mut manager,
            &FilterParam {
                mask: check_mask,
                version: seeded,
            },
            &FilterParam {
                mask: ComponentMask::new(),
                version: set_version,
            },
            None,
            None,
        );
        assert_eq!(total, 4);
        let entry = &result.entries[0];
        assert_eq!(entry.blocks.len(), 2);
        assert_eq!(entry.blocks[0], EntityBlock { begin: 0, end: 2 });
        assert_eq!(entry.blocks[1], EntityBlock { begin: 4, end: 6 });
    }
}
