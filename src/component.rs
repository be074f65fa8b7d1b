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

//! Component identity and the immutable component-type table.
//!
//! The table is populated once, before any world exists, and shared as an
//! `Arc`. The core only ever consults sizes, alignments and ids; typed access
//! goes through the `TypeId` index the builder records.

use std::any::TypeId;
use std::mem;
use std::sync::Arc;

use ahash::AHashMap;

use crate::error::{EcsError, Result};
use crate::mask::ComponentMask;

/// Marker trait for components.
///
/// The core moves component data with raw byte copies and never runs drop
/// glue, so component types must be plain old data: `Copy` enforces that.
/// Zero-sized types are legal and act as tags.
pub trait Component: Copy + Send + Sync + 'static {}

impl<T: Copy + Send + Sync + 'static> Component for T {}

/// Dense index into the component-type table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(pub u32);

impl ComponentId {
    /// Index as usize, for mask and layout lookups.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Size, alignment and optional stable identity of one component type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentInfo {
    /// Byte size; zero marks a tag component.
    pub size: u32,
    /// Alignment, a power of two; zero for tags.
    pub align: u32,
    /// Stable 128-bit identity used by external tooling to match components
    /// across runs. Not consulted by the core.
    pub guid: Option<u128>,
}

impl ComponentInfo {
    /// True for zero-size tag components.
    pub fn is_tag(&self) -> bool {
        self.size == 0
    }
}

/// Immutable vector of component metadata, indexed by [`ComponentId`].
#[derive(Debug)]
pub struct ComponentTypeTable {
    infos: Vec<ComponentInfo>,
    by_type: AHashMap<TypeId, ComponentId>,
}

impl ComponentTypeTable {
    /// Start building a table.
    pub fn builder() -> ComponentTypeTableBuilder {
        ComponentTypeTableBuilder::default()
    }

    /// Number of registered component types.
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Metadata for `id`, or `None` for an unknown id.
    pub fn info(&self, id: ComponentId) -> Option<&ComponentInfo> {
        self.infos.get(id.index())
    }

    /// Byte size of `id`; zero for tags and unknown ids.
    pub fn size_of(&self, id: ComponentId) -> u32 {
        self.info(id).map(|i| i.size).unwrap_or(0)
    }

    /// Id registered for the Rust type `T`.
    pub fn id_of<T: Component>(&self) -> Result<ComponentId> {
        self.id_of_type(TypeId::of::<T>())
    }

    /// Id registered for a raw `TypeId`.
    pub fn id_of_type(&self, type_id: TypeId) -> Result<ComponentId> {
        self.by_type
            .get(&type_id)
            .copied()
            .ok_or(EcsError::ComponentNotRegistered)
    }

    /// A mask sized to this table with no bits set.
    pub fn empty_mask(&self) -> ComponentMask {
        ComponentMask::with_capacity(self.infos.len().max(64))
    }
}

/// Builder assigning dense ids in registration order.
#[derive(Default)]
pub struct ComponentTypeTableBuilder {
    infos: Vec<ComponentInfo>,
    by_type: AHashMap<TypeId, ComponentId>,
}

impl ComponentTypeTableBuilder {
    /// Register the Rust type `T`, capturing its size and alignment.
    ///
    /// Re-registering a type returns its existing id.
    pub fn register<T: Component>(&mut self) -> ComponentId {
        let type_id = TypeId::of::<T>();
        if let Some(&id) = self.by_type.get(&type_id) {
            return id;
        }
        let size = mem::size_of::<T>() as u32;
        let align = if size == 0 {
            0
        } else {
            mem::align_of::<T>() as u32
        };
        let id = self.push(ComponentInfo {
            size,
            align,
            guid: None,
        });
        self.by_type.insert(type_id, id);
        id
    }

    /// Register a zero-size tag under the Rust type `T`.
    pub fn register_tag<T: Component>(&mut self) -> ComponentId {
        debug_assert_eq!(mem::size_of::<T>(), 0, "tag components must be zero-sized");
        self.register::<T>()
    }

    /// Register raw metadata with no Rust type attached (external generators).
    pub fn register_raw(&mut self, size: u32, align: u32, guid: Option<u128>) -> ComponentId {
        self.push(ComponentInfo { size, align, guid })
    }

    /// Attach a stable identity to an already registered component.
    pub fn set_guid(&mut self, id: ComponentId, guid: u128) {
        if let Some(info) = self.infos.get_mut(id.index()) {
            info.guid = Some(guid);
        }
    }

    fn push(&mut self, info: ComponentInfo) -> ComponentId {
        let id = ComponentId(self.infos.len() as u32);
        self.infos.push(info);
        id
    }

    /// Freeze the table.
    pub fn build(self) -> Arc<ComponentTypeTable> {
        Arc::new(ComponentTypeTable {
            infos: self.infos,
            by_type: self.by_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy)]
    struct Position {
        _x: f32,
        _y: f32,
        _z: f32,
    }

    #[derive(Clone, Copy)]
    struct Frozen;

    #[test]
    fn test_dense_ids_in_registration_order() {
        let mut builder = ComponentTypeTable::builder();
        let a = builder.register::<Position>();
        let b = builder.register::<u64>();
        assert_eq!(a, ComponentId(0));
        assert_eq!(b, ComponentId(1));

        let table = builder.build();
        assert_eq!(table.len(), 2);
        assert_eq!(table.id_of::<Position>().unwrap(), a);
        assert_eq!(table.id_of::<u64>().unwrap(), b);
    }

    #[test]
    fn test_reregistration_is_idempotent() {
        let mut builder = ComponentTypeTable::builder();
        let first = builder.register::<u32>();
        let second = builder.register::<u32>();
        assert_eq!(first, second);
        assert_eq!(builder.build().len(), 1);
    }

    #[test]
    fn test_tag_has_zero_size() {
        let mut builder = ComponentTypeTable::builder();
        let id = builder.register_tag::<Frozen>();
        let table = builder.build();
        let info = table.info(id).unwrap();
        assert!(info.is_tag());
        assert_eq!(info.align, 0);
    }

    #[test]
    fn test_unregistered_type_fails() {
        let table = ComponentTypeTable::builder().build();
        assert_eq!(
            table.id_of::<Position>().unwrap_err(),
            EcsError::ComponentNotRegistered
        );
    }

    #[test]
    fn test_raw_registration_and_guid() {
        let mut builder = ComponentTypeTable::builder();
        let id = builder.register_raw(12, 4, Some(0xdead_beef));
        let table = builder.build();
        assert_eq!(table.size_of(id), 12);
        assert_eq!(table.info(id).unwrap().guid, Some(0xdead_beef));
    }
}
