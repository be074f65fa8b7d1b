//! Convenience re-exports.

pub use crate::builder::{ComponentSource, EntityBuilder};
pub use crate::component::{Component, ComponentId, ComponentTypeTable};
pub use crate::config::{EcsConfig, EntityIdWidth};
pub use crate::entity::Entity;
pub use crate::error::{EcsError, Result};
pub use crate::mask::ComponentMask;
pub use crate::metadata::{ArchetypeId, ArchetypeMetadata, QueryPredicate};
pub use crate::query::{BuiltQuery, QueryBuilder};
pub use crate::world::World;
