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

//! Chunk-based archetype ECS core.
//!
//! Entities sharing a component set live in one archetype; each archetype
//! packs its entities into fixed-size chunks using a struct-of-arrays
//! layout. Structural changes migrate entities between archetypes through a
//! cached edge graph, and queries resolve to archetype lists maintained
//! incrementally as archetypes appear.

pub mod builder;
pub mod chunk;
pub mod component;
pub mod config;
pub mod entity;
pub mod error;
pub mod layout;
pub mod mask;
pub mod metadata;
pub mod query;
pub mod store;
pub mod sync;
pub mod utils;
pub mod world;

// Re-exports for convenience
pub use builder::{ComponentSource, EntityBuilder};
pub use chunk::{ChunkAllocator, ChunkGuard, ChunkHandle};
pub use component::{Component, ComponentId, ComponentInfo, ComponentTypeTable};
pub use config::{EcsConfig, EntityIdWidth};
pub use entity::{Entity, EntityLocation};
pub use error::{EcsError, Result};
pub use layout::ArchetypeLayout;
pub use mask::ComponentMask;
pub use metadata::{ArchetypeId, ArchetypeMetadata, QueryId, QueryPredicate};
pub use query::{BuiltQuery, ChunkView, QueryBuilder, QueryIter};
pub use store::ArchetypeStore;
pub use world::{ComponentRef, World, WorldStats};

pub mod prelude;
