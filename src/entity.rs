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

//! Entity handles and location metadata.
//!
//! An [`Entity`] is an opaque 64-bit value packing the slot index, the owning
//! world id and a generation counter. The generation is bumped every time the
//! slot index is recycled, so stale handles never alias a live entity.
//!
//! The top bit of the packed value is reserved: every constructible handle
//! keeps it clear, and the null sentinel (all ones) sets it, so no in-range
//! handle can ever compare equal to [`Entity::null`].

/// Bits reserved for the slot index (max ~1 billion entities per world)
const ID_BITS: u64 = 30;
/// Bits reserved for the world id
const WORLD_ID_BITS: u64 = 10;
/// Bits reserved for the generation counter; the remaining top bit of the
/// value is the null marker
const GENERATION_BITS: u64 = 23;

const ID_SHIFT: u64 = 0;
const WORLD_ID_SHIFT: u64 = ID_SHIFT + ID_BITS;
const GENERATION_SHIFT: u64 = WORLD_ID_SHIFT + WORLD_ID_BITS;

const ID_MASK: u64 = (1 << ID_BITS) - 1;
const WORLD_ID_MASK: u64 = (1 << WORLD_ID_BITS) - 1;
const GENERATION_MASK: u64 = (1 << GENERATION_BITS) - 1;

const NULL: u64 = u64::MAX;

/// Largest entity index a world can hold
pub const MAX_ENTITIES_PER_WORLD: u64 = 1 << ID_BITS;

/// Largest world id the handle can carry
pub const MAX_WORLD_COUNT: u64 = 1 << WORLD_ID_BITS;

/// Generations wrap inside this many values
pub const MAX_GENERATION_COUNT: u64 = 1 << GENERATION_BITS;

/// Opaque 64-bit entity handle: 30-bit index, 10-bit world id, 23-bit
/// generation, one reserved null-marker bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Entity {
    value: u64,
}

impl Default for Entity {
    fn default() -> Self {
        Self::null()
    }
}

impl Entity {
    /// The null handle (never valid in any world)
    pub const fn null() -> Self {
        Self { value: NULL }
    }

    /// Build a handle from its three fields
    pub const fn new(id: u32, generation: u32, world_id: u32) -> Self {
        Self {
            value: ((id as u64) & ID_MASK)
                | (((world_id as u64) & WORLD_ID_MASK) << WORLD_ID_SHIFT)
                | (((generation as u64) & GENERATION_MASK) << GENERATION_SHIFT),
        }
    }

    /// Reconstruct a handle from its packed representation
    pub const fn from_value(value: u64) -> Self {
        Self { value }
    }

    /// Packed representation (stable across the process lifetime)
    pub const fn value(self) -> u64 {
        self.value
    }

    pub const fn is_null(self) -> bool {
        self.value == NULL
    }

    /// Slot index within the owning world
    pub const fn id(self) -> u32 {
        (self.value & ID_MASK) as u32
    }

    pub const fn world_id(self) -> u32 {
        ((self.value >> WORLD_ID_SHIFT) & WORLD_ID_MASK) as u32
    }

    pub const fn generation(self) -> u32 {
        ((self.value >> GENERATION_SHIFT) & GENERATION_MASK) as u32
    }

    /// Same slot and world, generation + 1 (wrapping within the field)
    pub const fn with_next_generation(self) -> Self {
        Self::new(self.id(), self.generation().wrapping_add(1), self.world_id())
    }

    /// Same generation and world, different slot index.
    ///
    /// Used by the free list, which threads the next free slot through the
    /// id field of dead entries.
    pub const fn with_id(self, id: u32) -> Self {
        Self::new(id, self.generation(), self.world_id())
    }
}

/// Index of an archetype within its entity manager
pub(crate) const ARCHETYPE_NULL: u32 = u32::MAX;

/// Where an entity currently lives: which archetype, which slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityLocation {
    pub archetype: u32,
    pub slot: u32,
}

impl Default for EntityLocation {
    fn default() -> Self {
        Self {
            archetype: ARCHETYPE_NULL,
            slot: 0,
        }
    }
}

impl EntityLocation {
    pub fn is_null(&self) -> bool {
        self.archetype == ARCHETYPE_NULL
    }
}
