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

//! Struct-of-arrays chunk layout for one component mask.
//!
//! The layout is a pure function of (mask, type table, chunk size, entity-id
//! width): entity ids occupy a reserved region at offset 0, component arrays
//! follow ordered largest-alignment-first with ties broken by ascending
//! component id. Equal inputs always produce identical offsets.

use rustc_hash::FxHashMap;

use crate::component::{ComponentId, ComponentInfo, ComponentTypeTable};
use crate::mask::ComponentMask;
use crate::utils::align_to;

/// Offsets of one component array within a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutSlot {
    pub component_id: ComponentId,
    pub size: u32,
    pub align: u32,
    /// Byte offset of the array's first element. Zero for tag components,
    /// which are present but consume no bytes.
    pub base_offset: u32,
}

/// Immutable SoA layout shared by every chunk of one archetype.
#[derive(Debug)]
pub struct ArchetypeLayout {
    mask: ComponentMask,
    chunk_size: u32,
    entity_id_width: u32,
    entities_per_chunk: u32,
    slots: Vec<LayoutSlot>,
    slot_index: FxHashMap<ComponentId, usize>,
}

impl ArchetypeLayout {
    /// Compute the layout for `mask`.
    pub fn new(
        mask: ComponentMask,
        table: &ComponentTypeTable,
        chunk_size: u32,
        entity_id_width: u32,
    ) -> Self {
        // Quotient per the per-entity byte total, then back off until the
        // aligned placement actually fits the chunk.
        let per_entity: u64 = entity_id_width as u64
            + mask
                .iter()
                .map(|i| table.size_of(ComponentId(i as u32)) as u64)
                .sum::<u64>();
        let mut entities_per_chunk = (chunk_size as u64 / per_entity.max(1)) as u32;

        // Largest alignment first, ascending component id on ties.
        let mut ordered: Vec<ComponentId> = mask.iter().map(|i| ComponentId(i as u32)).collect();
        ordered.sort_by_key(|&id| {
            let info = table.info(id);
            let align = info.map(|i| i.align).unwrap_or(0);
            (std::cmp::Reverse(align), id)
        });

        let mut slots = Vec::with_capacity(ordered.len());
        loop {
            slots.clear();
            let mut cursor = entity_id_width as u64 * entities_per_chunk as u64;
            let mut fits = true;
            for &id in &ordered {
                let info = table.info(id).copied().unwrap_or(ComponentInfo {
                    size: 0,
                    align: 0,
                    guid: None,
                });
                if info.size == 0 {
                    slots.push(LayoutSlot {
                        component_id: id,
                        size: 0,
                        align: 0,
                        base_offset: 0,
                    });
                    continue;
                }
                cursor = align_to(cursor as usize, info.align.max(1) as usize) as u64;
                let end = cursor + info.size as u64 * entities_per_chunk as u64;
                if end > chunk_size as u64 {
                    fits = false;
                    break;
                }
                slots.push(LayoutSlot {
                    component_id: id,
                    size: info.size,
                    align: info.align,
                    base_offset: cursor as u32,
                });
                cursor = end;
            }
            if fits || entities_per_chunk == 0 {
                break;
            }
            entities_per_chunk -= 1;
        }

        let slot_index = slots
            .iter()
            .enumerate()
            .map(|(i, slot)| (slot.component_id, i))
            .collect();

        Self {
            mask,
            chunk_size,
            entity_id_width,
            entities_per_chunk,
            slots,
            slot_index,
        }
    }

    /// The component mask this layout was built for.
    pub fn component_mask(&self) -> &ComponentMask {
        &self.mask
    }

    /// Chunk size the layout was computed against.
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Byte width of the entity-id array elements.
    pub fn entity_id_width(&self) -> u32 {
        self.entity_id_width
    }

    /// Entities each chunk of this archetype holds.
    pub fn entities_per_chunk(&self) -> u32 {
        self.entities_per_chunk
    }

    /// True if the component is part of this layout (tags included).
    pub fn has(&self, id: ComponentId) -> bool {
        self.slot_index.contains_key(&id)
    }

    /// Slot metadata for `id`.
    pub fn slot(&self, id: ComponentId) -> Option<&LayoutSlot> {
        self.slot_index.get(&id).map(|&i| &self.slots[i])
    }

    /// Base offset of the component's array.
    pub fn base_offset(&self, id: ComponentId) -> Option<u32> {
        self.slot(id).map(|s| s.base_offset)
    }

    /// Byte offset of entity `index`'s data for component `id`.
    pub fn offset(&self, id: ComponentId, index: u32) -> Option<u32> {
        self.slot(id).map(|s| s.base_offset + index * s.size)
    }

    /// Byte offset of entity `index`'s id within the reserved region.
    pub fn entity_id_offset(&self, index: u32) -> u32 {
        index * self.entity_id_width
    }

    /// All component slots, alignment-ordered as placed.
    pub fn slots(&self) -> &[LayoutSlot] {
        &self.slots
    }

    /// Lowest component id in the mask.
    pub fn min_component_id(&self) -> Option<ComponentId> {
        self.mask.first_set().map(|i| ComponentId(i as u32))
    }

    /// Highest component id in the mask.
    pub fn max_component_id(&self) -> Option<ComponentId> {
        self.mask.last_set().map(|i| ComponentId(i as u32))
    }
}
