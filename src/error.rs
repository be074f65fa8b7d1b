// Copyright 2024 Saptak Santra
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
///
/// The capacity-exceeded family are runtime conditions the caller is expected
/// to catch; everything else signals a programming error at the call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EcsError {
    /// Entity handle has version 0 or an id outside the directory
    InvalidEntityHandle,

    /// Entity handle version does not match the directory slot
    StaleEntityHandle,

    /// Handle refers to a destroyed entity
    EntityNotAlive,

    /// Archetype id does not name an interned archetype
    InvalidArchetypeHandle,

    /// Operation requires a component the entity does not carry
    MissingComponent,

    /// `add_component` called for a component the entity already carries
    DuplicateComponent,

    /// Component type was never registered in the component-type table
    ComponentNotRegistered,

    /// Bit index outside the mask's fixed capacity
    MaskIndexOutOfRange { index: usize, capacity: usize },

    /// The next entity id would overflow the configured id byte width
    EntityIdExceedsLimit { limit: u32 },

    /// Creating another archetype would exceed the configured maximum
    ArchetypeIdLimitExceeded { limit: u32 },

    /// The chunk allocator is at its configured slot maximum
    ChunkCapacityExceeded { limit: u32 },

    /// Interning another query predicate would exceed the configured maximum
    QueryLimitExceeded { limit: u32 },

    /// Free attempted on a chunk with a non-zero borrow count
    ChunkInUse,

    /// Chunk handle version does not match the slot's current version
    StaleChunkHandle,

    /// Operation on a disposed world
    Disposed,

    /// Configuration rejected by validation
    InvalidConfig(String),
}

impl fmt::Display for EcsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EcsError::InvalidEntityHandle => write!(f, "Invalid entity handle"),
            EcsError::StaleEntityHandle => write!(f, "Stale entity handle"),
            EcsError::EntityNotAlive => write!(f, "Entity is not alive"),
            EcsError::InvalidArchetypeHandle => write!(f, "Invalid archetype id"),
            EcsError::MissingComponent => write!(f, "Entity does not have the component"),
            EcsError::DuplicateComponent => write!(f, "Entity already has the component"),
            EcsError::ComponentNotRegistered => {
                write!(f, "Component type is not registered in the type table")
            }
            EcsError::MaskIndexOutOfRange { index, capacity } => {
                write!(f, "Mask index {index} out of range (capacity {capacity})")
            }
            EcsError::EntityIdExceedsLimit { limit } => {
                write!(f, "Entity id exceeds the configured limit of {limit}")
            }
            EcsError::ArchetypeIdLimitExceeded { limit } => {
                write!(f, "Archetype id limit exceeded (max {limit})")
            }
            EcsError::ChunkCapacityExceeded { limit } => {
                write!(f, "Chunk capacity exceeded (max {limit} chunks)")
            }
            EcsError::QueryLimitExceeded { limit } => {
                write!(f, "Query limit exceeded (max {limit} queries)")
            }
            EcsError::ChunkInUse => write!(f, "Chunk is borrowed and cannot be freed"),
            EcsError::StaleChunkHandle => write!(f, "Stale chunk handle"),
            EcsError::Disposed => write!(f, "World has been disposed"),
            EcsError::InvalidConfig(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for EcsError {}

/// Result type alias
pub type Result<T> = std::result::Result<T, EcsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_limits() {
        let err = EcsError::ChunkCapacityExceeded { limit: 64 };
        assert!(err.to_string().contains("64"));

        let err = EcsError::MaskIndexOutOfRange {
            index: 300,
            capacity: 256,
        };
        assert!(err.to_string().contains("300"));
        assert!(err.to_string().contains("256"));
    }
}
