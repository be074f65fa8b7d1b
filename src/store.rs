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

//! Per-archetype chunk storage with row allocation and swap-removal.
//!
//! Entities pack densely: every chunk before the last is full, only the tail
//! may be partial. A removal copies the tail row into the vacated slot and
//! frees the tail chunk once it empties.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::chunk::{ChunkAllocator, ChunkHandle};
use crate::error::{EcsError, Result};
use crate::layout::ArchetypeLayout;
use crate::metadata::ArchetypeId;
use crate::utils::{read_entity_id, write_entity_id};

/// Chunk list and entity count for one archetype within one world.
pub struct ArchetypeStore {
    id: ArchetypeId,
    layout: Arc<ArchetypeLayout>,
    allocator: Arc<ChunkAllocator>,
    chunks: SmallVec<[ChunkHandle; 4]>,
    entity_count: u32,
}

impl ArchetypeStore {
    pub fn new(
        id: ArchetypeId,
        layout: Arc<ArchetypeLayout>,
        allocator: Arc<ChunkAllocator>,
    ) -> Self {
        Self {
            id,
            layout,
            allocator,
            chunks: SmallVec::new(),
            entity_count: 0,
        }
    }

    pub fn id(&self) -> ArchetypeId {
        self.id
    }

    pub fn layout(&self) -> &Arc<ArchetypeLayout> {
        &self.layout
    }

    pub fn entity_count(&self) -> u32 {
        self.entity_count
    }

    pub fn is_empty(&self) -> bool {
        self.entity_count == 0
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Chunk handle by index, for copy and query use.
    pub fn get_chunk(&self, chunk_index: u32) -> Option<ChunkHandle> {
        self.chunks.get(chunk_index as usize).copied()
    }

    pub fn chunks(&self) -> &[ChunkHandle] {
        &self.chunks
    }

    /// Split a global index into `(chunk_index, index_in_chunk)`.
    pub fn get_chunk_location(&self, global_index: u32) -> (u32, u32) {
        let epc = self.layout.entities_per_chunk();
        (global_index / epc, global_index % epc)
    }

    /// Inverse of [`get_chunk_location`](Self::get_chunk_location).
    pub fn get_global_index(&self, chunk_index: u32, index_in_chunk: u32) -> u32 {
        chunk_index * self.layout.entities_per_chunk() + index_in_chunk
    }

    /// Occupied slots within the chunk at `chunk_index`.
    pub fn occupied_in_chunk(&self, chunk_index: u32) -> u32 {
        let epc = self.layout.entities_per_chunk();
        let start = chunk_index * epc;
        self.entity_count.saturating_sub(start).min(epc)
    }

    /// Allocate the next slot and write `entity_id` into the id array.
    ///
    /// Acquires a fresh chunk when the tail is full. Returns the slot's
    /// global index.
    pub fn allocate_entity(&mut self, entity_id: u32) -> Result<u32> {
        let epc = self.layout.entities_per_chunk();
        if epc == 0 {
            return Err(EcsError::InvalidConfig(format!(
                "component set does not fit a {}-byte chunk",
                self.layout.chunk_size()
            )));
        }

        if self.entity_count == self.chunks.len() as u32 * epc {
            let handle = self.allocator.allocate()?;
            self.chunks.push(handle);
        }

        let global_index = self.entity_count;
        let (chunk_index, index_in_chunk) = self.get_chunk_location(global_index);
        let chunk = self.chunks[chunk_index as usize];
        let base = self
            .allocator
            .data_ptr(chunk)
            .ok_or(EcsError::StaleChunkHandle)?;
        unsafe {
            write_entity_id(
                base.as_ptr()
                    .add(self.layout.entity_id_offset(index_in_chunk) as usize),
                self.layout.entity_id_width(),
                entity_id,
            );
        }
        self.entity_count += 1;
        Ok(global_index)
    }

    /// Swap-remove the slot at `global_index`.
    ///
    /// Returns the id of the entity moved into the vacated slot, or `None`
    /// when the removed slot was the last (or the index was out of range,
    /// which is a no-op). Frees the tail chunk once it empties; a
    /// borrow-pinned tail is kept and reused by the next allocation.
    pub fn remove_entity(&mut self, global_index: u32) -> Option<u32> {
        if global_index >= self.entity_count {
            return None;
        }

        let last_index = self.entity_count - 1;
        let moved = if global_index != last_index {
            self.copy_row(last_index, global_index);
            self.entity_id_at(global_index)
        } else {
            None
        };
        self.entity_count -= 1;

        let epc = self.layout.entities_per_chunk();
        if !self.chunks.is_empty() && self.entity_count <= (self.chunks.len() as u32 - 1) * epc {
            let tail = *self.chunks.last().unwrap();
            if self.allocator.free(tail).is_ok() {
                self.chunks.pop();
            }
        }

        moved
    }

    /// Entity id stored at `global_index`.
    pub fn entity_id_at(&self, global_index: u32) -> Option<u32> {
        if global_index >= self.entity_count {
            return None;
        }
        let (chunk_index, index_in_chunk) = self.get_chunk_location(global_index);
        let chunk = self.get_chunk(chunk_index)?;
        let base = self.allocator.data_ptr(chunk)?;
        Some(unsafe {
            read_entity_id(
                base.as_ptr()
                    .add(self.layout.entity_id_offset(index_in_chunk) as usize),
                self.layout.entity_id_width(),
            )
        })
    }

    /// Copy the full row (entity id plus every non-tag component) from
    /// `src_global` into `dst_global`.
    fn copy_row(&mut self, src_global: u32, dst_global: u32) {
        let (src_chunk, src_idx) = self.get_chunk_location(src_global);
        let (dst_chunk, dst_idx) = self.get_chunk_location(dst_global);
        let src_base = match self.allocator.data_ptr(self.chunks[src_chunk as usize]) {
            Some(ptr) => ptr.as_ptr(),
            None => return,
        };
        let dst_base = match self.allocator.data_ptr(self.chunks[dst_chunk as usize]) {
            Some(ptr) => ptr.as_ptr(),
            None => return,
        };

        let width = self.layout.entity_id_width();
        unsafe {
            std::ptr::copy_nonoverlapping(
                src_base.add(self.layout.entity_id_offset(src_idx) as usize),
                dst_base.add(self.layout.entity_id_offset(dst_idx) as usize),
                width as usize,
            );
            for slot in self.layout.slots() {
                if slot.size == 0 {
                    continue;
                }
                let src = src_base.add((slot.base_offset + src_idx * slot.size) as usize);
                let dst = dst_base.add((slot.base_offset + dst_idx * slot.size) as usize);
                std::ptr::copy_nonoverlapping(src, dst, slot.size as usize);
            }
        }
    }
}

impl Drop for ArchetypeStore {
    fn drop(&mut self) {
        for &chunk in &self.chunks {
            let _ = self.allocator.free(chunk);
        }
    }
}
