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

//! Builder contract for injecting typed data into chunks.
//!
//! A [`ComponentSource`] declares its component set, then writes each
//! component's bytes at the layout-computed offset. Bulk world operations
//! (`create_entity`, `add_components`, `overwrite`) consume the whole set in
//! one structural move instead of one migration per component.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::component::{Component, ComponentId, ComponentTypeTable};
use crate::error::{EcsError, Result};
use crate::layout::ArchetypeLayout;
use crate::mask::ComponentMask;

/// Capability contract through which external generators inject typed data.
pub trait ComponentSource {
    /// OR-set every carried component id into `mask`.
    fn collect_types(&self, mask: &mut ComponentMask) -> Result<()>;

    /// Write each carried component's bytes for the entity at
    /// `index_in_chunk`, at the offsets `layout` computed.
    ///
    /// # Safety
    /// `chunk_base` must point at a live chunk buffer laid out by `layout`.
    unsafe fn write_components(
        &self,
        layout: &ArchetypeLayout,
        chunk_base: *mut u8,
        index_in_chunk: u32,
    );
}

#[derive(Debug)]
struct BuilderEntry {
    component: ComponentId,
    bytes: SmallVec<[u8; 16]>,
}

/// Byte-buffer component source with a typed fluent surface.
#[derive(Debug)]
pub struct EntityBuilder {
    table: Arc<ComponentTypeTable>,
    entries: SmallVec<[BuilderEntry; 8]>,
}

impl EntityBuilder {
    pub fn new(table: Arc<ComponentTypeTable>) -> Self {
        Self {
            table,
            entries: SmallVec::new(),
        }
    }

    /// Number of distinct components collected.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add (or replace) component `T` with `value`.
    pub fn add<T: Component>(&mut self, value: T) -> Result<&mut Self> {
        let id = self.table.id_of::<T>()?;
        let size = std::mem::size_of::<T>();
        let bytes = unsafe {
            std::slice::from_raw_parts(&value as *const T as *const u8, size)
        };
        self.add_raw(id, bytes)
    }

    /// Fluent variant of [`add`](Self::add).
    pub fn with<T: Component>(mut self, value: T) -> Result<Self> {
        self.add(value)?;
        Ok(self)
    }

    /// Add (or replace) a component by id with raw bytes.
    ///
    /// `bytes.len()` must equal the registered size.
    pub fn add_raw(&mut self, id: ComponentId, bytes: &[u8]) -> Result<&mut Self> {
        let info = self.table.info(id).ok_or(EcsError::ComponentNotRegistered)?;
        if bytes.len() != info.size as usize {
            return Err(EcsError::ComponentNotRegistered);
        }
        match self.entries.iter_mut().find(|e| e.component == id) {
            Some(entry) => entry.bytes = SmallVec::from_slice(bytes),
            None => self.entries.push(BuilderEntry {
                component: id,
                bytes: SmallVec::from_slice(bytes),
            }),
        }
        Ok(self)
    }

    /// Remove a previously added component from the builder.
    pub fn remove(&mut self, id: ComponentId) -> &mut Self {
        self.entries.retain(|e| e.component != id);
        self
    }

    /// Ids collected so far, in insertion order.
    pub fn component_ids(&self) -> impl Iterator<Item = ComponentId> + '_ {
        self.entries.iter().map(|e| e.component)
    }
}

impl ComponentSource for EntityBuilder {
    fn collect_types(&self, mask: &mut ComponentMask) -> Result<()> {
        for entry in &self.entries {
            mask.set(entry.component.index())?;
        }
        Ok(())
    }

    unsafe fn write_components(
        &self,
        layout: &ArchetypeLayout,
        chunk_base: *mut u8,
        index_in_chunk: u32,
    ) {
        for entry in &self.entries {
            if entry.bytes.is_empty() {
                continue;
            }
            if let Some(offset) = layout.offset(entry.component, index_in_chunk) {
                std::ptr::copy_nonoverlapping(
                    entry.bytes.as_ptr(),
                    chunk_base.add(offset as usize),
                    entry.bytes.len(),
                );
            }
        }
    }
}
