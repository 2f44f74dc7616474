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

//! Component version storage for change detection.
//!
//! Each archetype carries, per component column, a last-write timestamp at
//! two granularities: archetype-global and per chunk of `chunk_size` slots.
//! Timestamps are world-local monotonic counters; [`WorldVersion`] is a u32
//! with 0 reserved as "never". Wraparound at 2^32 is documented as out of
//! scope: a world advances its version once per update and once per job
//! dispatch, which keeps realistic workloads far below the limit.

use smallvec::SmallVec;

/// World-local monotonic timestamp. Zero means "never written".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct WorldVersion(u32);

impl WorldVersion {
    pub const NULL: WorldVersion = WorldVersion(0);

    /// First valid version
    pub const FIRST: WorldVersion = WorldVersion(1);

    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn next(self) -> Self {
        Self(self.0.checked_add(1).expect("world version overflow"))
    }
}

/// A version predicate or stamp target: which component indices (positions
/// within the archetype), and which version to compare or write.
#[derive(Debug, Clone, Default)]
pub struct VersionParam {
    pub version: WorldVersion,
    pub components: SmallVec<[usize; 8]>,
}

/// Per-archetype version words at global and chunk granularity.
pub struct VersionStorage {
    chunk_size: u32,
    num_components: usize,
    global: Vec<WorldVersion>,
    /// `chunks[chunk * num_components + component]`
    chunks: Vec<WorldVersion>,
    /// Component indices that participate; empty disables tracking entirely
    enabled: Vec<bool>,
    any_enabled: bool,
}

impl VersionStorage {
    pub fn new(num_components: usize, chunk_size: u32, enabled: Vec<bool>) -> Self {
        debug_assert!(chunk_size > 0);
        debug_assert_eq!(enabled.len(), num_components);
        let any_enabled = enabled.iter().any(|&e| e);
        Self {
            chunk_size,
            num_components,
            global: vec![WorldVersion::NULL; num_components],
            chunks: Vec::new(),
            enabled,
            any_enabled,
        }
    }

    pub fn enabled(&self) -> bool {
        self.any_enabled
    }

    pub fn chunk_size(&self) -> u32 {
        if self.any_enabled {
            self.chunk_size
        } else {
            u32::MAX
        }
    }

    /// Chunk index covering `slot`
    pub fn chunk_at(&self, slot: usize) -> usize {
        if self.any_enabled {
            slot / self.chunk_size as usize
        } else {
            0
        }
    }

    pub fn chunk_count(&self) -> usize {
        if self.num_components == 0 {
            0
        } else {
            self.chunks.len() / self.num_components
        }
    }

    /// Make sure the chunk covering `slot` has version words
    pub fn ensure_slot(&mut self, slot: usize) {
        if !self.any_enabled {
            return;
        }
        let chunk = self.chunk_at(slot);
        let needed = (chunk + 1) * self.num_components;
        if self.chunks.len() < needed {
            self.chunks.resize(needed, WorldVersion::NULL);
        }
    }

    /// Stamp every component of one chunk (and the global words)
    pub fn stamp_chunk(&mut self, version: WorldVersion, chunk: usize) {
        if !self.any_enabled {
            return;
        }
        let base = chunk * self.num_components;
        for component in 0..self.num_components {
            if self.enabled[component] {
                self.global[component] = version;
                self.chunks[base + component] = version;
            }
        }
    }

    /// Stamp one component of one chunk (and its global word)
    pub fn stamp(&mut self, version: WorldVersion, chunk: usize, component: usize) {
        if !self.any_enabled || !self.enabled[component] {
            return;
        }
        self.chunks[chunk * self.num_components + component] = version;
        self.global[component] = version;
    }

    pub fn global_version(&self, component: usize) -> WorldVersion {
        self.global[component]
    }

    pub fn chunk_version(&self, chunk: usize, component: usize) -> WorldVersion {
        if !self.any_enabled || !self.enabled[component] {
            return WorldVersion::NULL;
        }
        self.chunks[chunk * self.num_components + component]
    }

    /// The change-detection primitive at archetype granularity.
    ///
    /// Returns true iff any component in `check` has a version strictly
    /// greater than `check.version` (an empty check mask or a null check
    /// version always passes), and in that case stamps every component in
    /// `set` with `set.version`.
    pub fn check_and_stamp(&mut self, check: &VersionParam, set: &VersionParam) -> bool {
        if !self.any_enabled {
            return true;
        }
        let mut hit = check.version.is_null() || check.components.is_empty();
        if !hit {
            for &component in &check.components {
                if self.global[component] > check.version {
                    hit = true;
                    break;
                }
            }
        }
        if hit {
            for &component in &set.components {
                self.global[component] = set.version;
            }
        }
        hit
    }

    /// Same primitive at chunk granularity.
    pub fn check_and_stamp_chunk(
        &mut self,
        check: &VersionParam,
        set: &VersionParam,
        chunk: usize,
    ) -> bool {
        if !self.any_enabled {
            return true;
        }
        let base = chunk * self.num_components;
        let mut hit = check.version.is_null() || check.components.is_empty();
        if !hit {
            for &component in &check.components {
                if self.chunks[base + component] > check.version {
                    hit = true;
                    break;
                }
            }
        }
        if hit {
            for &component in &set.components {
                self.chunks[base + component] = set.version;
            }
        }
        hit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(components: usize, chunk: u32) -> VersionStorage {
        VersionStorage::new(components, chunk, vec![true; components])
    }

    fn param(version: u32, components: &[usize]) -> VersionParam {
        VersionParam {
            version: WorldVersion::new(version),
            components: components.iter().copied().collect(),
        }
    }

    #[test]
    fn test_stamp_and_read() {
        let mut vs = storage(3, 4);
        vs.ensure_slot(5); // chunk 1
        vs.stamp(WorldVersion::new(7), 1, 2);
        assert_eq!(vs.chunk_version(1, 2), WorldVersion::new(7));
        assert_eq!(vs.global_version(2), WorldVersion::new(7));
        assert_eq!(vs.chunk_version(1, 0), WorldVersion::NULL);
    }

    #[test]
    fn test_check_and_stamp_semantics() {
        let mut vs = storage(2, 4);
        vs.ensure_slot(0);
        vs.stamp(WorldVersion::new(5), 0, 0);

        // strictly-greater comparison
        assert!(vs.check_and_stamp(&param(4, &[0]), &param(9, &[1])));
        assert_eq!(vs.global_version(1), WorldVersion::new(9));
        assert!(!vs.check_and_stamp(&param(5, &[0]), &param(10, &[1])));
        // a failed check stamps nothing
        assert_eq!(vs.global_version(1), WorldVersion::new(9));
    }

    #[test]
    fn test_empty_check_always_passes() {
        let mut vs = storage(1, 4);
        vs.ensure_slot(0);
        assert!(vs.check_and_stamp(&param(100, &[]), &param(101, &[0])));
        assert!(vs.check_and_stamp(
            &VersionParam {
                version: WorldVersion::NULL,
                components: [0usize].into_iter().collect()
            },
            &param(102, &[0])
        ));
    }

    #[test]
    fn test_disabled_component_is_silent() {
        let mut vs = VersionStorage::new(2, 4, vec![true, false]);
        vs.ensure_slot(0);
        vs.stamp(WorldVersion::new(3), 0, 1);
        assert_eq!(vs.chunk_version(0, 1), WorldVersion::NULL);
        vs.stamp(WorldVersion::new(3), 0, 0);
        assert_eq!(vs.chunk_version(0, 0), WorldVersion::new(3));
    }

    #[test]
    fn test_fully_disabled_always_matches() {
        let mut vs = VersionStorage::new(2, 4, vec![false, false]);
        assert!(!vs.enabled());
        assert!(vs.check_and_stamp(&param(7, &[0, 1]), &param(8, &[0])));
        assert_eq!(vs.chunk_size(), u32::MAX);
    }

    #[test]
    fn test_chunk_granularity() {
        let mut vs = storage(1, 2);
        vs.ensure_slot(5); // chunks 0..=2
        vs.stamp(WorldVersion::new(4), 2, 0);

        // only chunk 2 moved past version 3
        assert!(!vs.check_and_stamp_chunk(&param(4, &[0]), &param(9, &[0]), 0));
        assert!(vs.check_and_stamp_chunk(&param(3, &[0]), &param(9, &[0]), 2));
        assert_eq!(vs.chunk_version(2, 0), WorldVersion::new(9));
    }
}
