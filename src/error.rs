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

//! Error types

use std::fmt;

/// ECS error type
#[derive(Debug, Clone)]
pub enum EcsError {
    /// Entity handle failed validation (stale generation, wrong world, out of range)
    InvalidEntity,

    /// A lifecycle hook required by the operation is missing from the descriptor
    MissingHook {
        component: String,
        hook: &'static str,
    },

    /// Chunk-size predicates produced an unsatisfiable range at archetype creation
    ChunkConstraint { min: u32, max: u32 },

    /// A component declared itself as its own dependency
    SelfDependency(String),

    /// Allocation failure propagated from the storage layer
    AllocationFailed { bytes: usize },

    /// Structural mutation attempted in a context that forbids it
    Locked(&'static str),
}

impl fmt::Display for EcsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EcsError::InvalidEntity => write!(f, "Invalid entity handle"),
            EcsError::MissingHook { component, hook } => {
                write!(f, "Component '{component}' has no '{hook}' hook")
            }
            EcsError::ChunkConstraint { min, max } => {
                write!(f, "Cannot create archetype: chunk capacity {max} < {min}")
            }
            EcsError::SelfDependency(name) => {
                write!(f, "Self dependency is not allowed for '{name}'")
            }
            EcsError::AllocationFailed { bytes } => {
                write!(f, "Allocation of {bytes} bytes failed")
            }
            EcsError::Locked(op) => {
                write!(
                    f,
                    "Operation '{op}' is not allowed while the entity manager is locked"
                )
            }
        }
    }
}

impl std::error::Error for EcsError {}

/// Result type alias
pub type Result<T> = std::result::Result<T, EcsError>;
