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

//! Query surface: predicate building and chunk-level iteration.
//!
//! A built query holds only its interned query id; the shared metadata owns
//! the append-only match list. Iteration walks matched archetypes, then each
//! archetype's chunks, yielding [`ChunkView`]s that expose component arrays
//! directly — no per-entity lookups. Archetypes interned after iteration
//! starts may or may not be visited.

use std::any::TypeId;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::chunk::ChunkGuard;
use crate::component::{Component, ComponentId, ComponentTypeTable};
use crate::error::{EcsError, Result};
use crate::layout::ArchetypeLayout;
use crate::mask::ComponentMask;
use crate::metadata::{ArchetypeId, QueryId, QueryPredicate};
use crate::utils::read_entity_id;
use crate::world::World;

/// Fluent builder for an all/any/none predicate.
#[derive(Debug, Default, Clone)]
pub struct QueryBuilder {
    all_types: SmallVec<[TypeId; 8]>,
    any_types: SmallVec<[TypeId; 8]>,
    none_types: SmallVec<[TypeId; 8]>,
    all_ids: SmallVec<[ComponentId; 8]>,
    any_ids: SmallVec<[ComponentId; 8]>,
    none_ids: SmallVec<[ComponentId; 8]>,
}

impl QueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require component `T`.
    pub fn with<T: Component>(mut self) -> Self {
        self.all_types.push(TypeId::of::<T>());
        self
    }

    /// Exclude component `T`.
    pub fn without<T: Component>(mut self) -> Self {
        self.none_types.push(TypeId::of::<T>());
        self
    }

    /// Require at least one of the `with_any` components.
    pub fn with_any<T: Component>(mut self) -> Self {
        self.any_types.push(TypeId::of::<T>());
        self
    }

    /// Id-based variant of [`with`](Self::with).
    pub fn with_id(mut self, id: ComponentId) -> Self {
        self.all_ids.push(id);
        self
    }

    /// Id-based variant of [`without`](Self::without).
    pub fn without_id(mut self, id: ComponentId) -> Self {
        self.none_ids.push(id);
        self
    }

    /// Id-based variant of [`with_any`](Self::with_any).
    pub fn with_any_id(mut self, id: ComponentId) -> Self {
        self.any_ids.push(id);
        self
    }

    /// Intern the predicate in the world's shared metadata.
    pub fn build(&self, world: &World) -> Result<BuiltQuery> {
        let table = world.metadata().table();
        let resolve = |types: &[TypeId], ids: &[ComponentId]| -> Result<ComponentMask> {
            let mut mask = table.empty_mask();
            for &type_id in types {
                mask.set(table.id_of_type(type_id)?.index())?;
            }
            for &id in ids {
                mask.set(id.index())?;
            }
            Ok(mask)
        };

        let predicate = QueryPredicate {
            all: resolve(&self.all_types, &self.all_ids)?,
            any: resolve(&self.any_types, &self.any_ids)?,
            none: resolve(&self.none_types, &self.none_ids)?,
        };
        let query_id = world.metadata().get_or_create_query(predicate)?;
        Ok(BuiltQuery { query_id })
    }
}

/// A query interned in the shared metadata, identified by its dense id.
#[derive(Debug, Clone, Copy)]
pub struct BuiltQuery {
    query_id: QueryId,
}

impl BuiltQuery {
    pub fn id(&self) -> QueryId {
        self.query_id
    }

    /// Matched archetype ids at call time.
    pub fn matched_archetypes(&self, world: &World) -> Vec<ArchetypeId> {
        world
            .metadata()
            .matched_archetype_ids(self.query_id)
            .map(|list| list.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Total entities this world holds across matched archetypes.
    pub fn count(&self, world: &World) -> u32 {
        self.matched_archetypes(world)
            .into_iter()
            .filter_map(|archetype| world.chunk_snapshot(archetype))
            .map(|(_, _, count)| count)
            .sum()
    }

    /// Iterate the matched chunks of `world`.
    pub fn iter<'w>(&self, world: &'w World) -> QueryIter<'w> {
        let snapshot_len = world
            .metadata()
            .matched_archetype_ids(self.query_id)
            .map(|list| list.len())
            .unwrap_or(0);
        QueryIter {
            world,
            query_id: self.query_id,
            snapshot_len,
            position: 0,
            cursor: None,
        }
    }

    /// Run `f` over every matched chunk.
    pub fn for_each_chunk<'w, F>(&self, world: &'w World, mut f: F)
    where
        F: FnMut(ChunkView<'w>),
    {
        for view in self.iter(world) {
            f(view);
        }
    }

    /// Run `f` over every matched chunk, archetypes split across the rayon
    /// pool.
    #[cfg(feature = "parallel")]
    pub fn par_for_each_chunk<'w, F>(&self, world: &'w World, f: F)
    where
        F: Fn(ChunkView<'w>) + Send + Sync,
    {
        use rayon::prelude::*;

        let archetypes = self.matched_archetypes(world);
        archetypes.into_par_iter().for_each(|archetype| {
            let Some((layout, chunks, entity_count)) = world.chunk_snapshot(archetype) else {
                return;
            };
            let epc = layout.entities_per_chunk();
            for (chunk_index, &chunk) in chunks.iter().enumerate() {
                let occupied = entity_count
                    .saturating_sub(chunk_index as u32 * epc)
                    .min(epc);
                if occupied == 0 {
                    continue;
                }
                if let Some(view) =
                    ChunkView::open(world, archetype, Arc::clone(&layout), chunk, occupied)
                {
                    f(view);
                }
            }
        });
    }
}

struct ArchetypeCursor {
    archetype: ArchetypeId,
    layout: Arc<ArchetypeLayout>,
    chunks: SmallVec<[crate::chunk::ChunkHandle; 4]>,
    entity_count: u32,
    next_chunk: u32,
}

/// Iterator over matched chunks.
///
/// Honors concurrent match-list appends at snapshot granularity: every
/// archetype present when the iterator was created is visited.
pub struct QueryIter<'w> {
    world: &'w World,
    query_id: QueryId,
    snapshot_len: usize,
    position: usize,
    cursor: Option<ArchetypeCursor>,
}

impl<'w> Iterator for QueryIter<'w> {
    type Item = ChunkView<'w>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(cursor) = &mut self.cursor {
                let epc = cursor.layout.entities_per_chunk();
                while (cursor.next_chunk as usize) < cursor.chunks.len() {
                    let chunk_index = cursor.next_chunk;
                    cursor.next_chunk += 1;
                    let occupied = cursor
                        .entity_count
                        .saturating_sub(chunk_index * epc)
                        .min(epc);
                    if occupied == 0 {
                        continue;
                    }
                    let chunk = cursor.chunks[chunk_index as usize];
                    if let Some(view) = ChunkView::open(
                        self.world,
                        cursor.archetype,
                        Arc::clone(&cursor.layout),
                        chunk,
                        occupied,
                    ) {
                        return Some(view);
                    }
                }
                self.cursor = None;
            }

            if self.position >= self.snapshot_len {
                return None;
            }
            let archetype = {
                let list = self.world.metadata().matched_archetype_ids(self.query_id)?;
                *list.get(self.position)?
            };
            self.position += 1;

            if let Some((layout, chunks, entity_count)) = self.world.chunk_snapshot(archetype) {
                if entity_count > 0 {
                    self.cursor = Some(ArchetypeCursor {
                        archetype,
                        layout,
                        chunks,
                        entity_count,
                        next_chunk: 0,
                    });
                }
            }
        }
    }
}

/// One matched chunk, borrow-pinned for the view's lifetime.
///
/// Exposes component arrays as typed slices over the chunk's SoA regions.
pub struct ChunkView<'w> {
    guard: ChunkGuard<'w>,
    layout: Arc<ArchetypeLayout>,
    table: &'w ComponentTypeTable,
    archetype: ArchetypeId,
    occupied: u32,
}

impl<'w> ChunkView<'w> {
    fn open(
        world: &'w World,
        archetype: ArchetypeId,
        layout: Arc<ArchetypeLayout>,
        chunk: crate::chunk::ChunkHandle,
        occupied: u32,
    ) -> Option<Self> {
        let guard = world.allocator().acquire_guard(chunk)?;
        let table: &'w ComponentTypeTable = world.metadata().table();
        Some(Self {
            guard,
            layout,
            table,
            archetype,
            occupied,
        })
    }

    pub fn archetype_id(&self) -> ArchetypeId {
        self.archetype
    }

    pub fn layout(&self) -> &ArchetypeLayout {
        &self.layout
    }

    /// Occupied slots in this chunk.
    pub fn len(&self) -> usize {
        self.occupied as usize
    }

    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    /// Entity id stored at slot `index`.
    pub fn entity_id(&self, index: u32) -> Option<u32> {
        if index >= self.occupied {
            return None;
        }
        Some(unsafe {
            read_entity_id(
                self.guard
                    .as_ptr()
                    .add(self.layout.entity_id_offset(index) as usize),
                self.layout.entity_id_width(),
            )
        })
    }

    /// Iterate the entity ids in this chunk.
    pub fn entity_ids(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.occupied).filter_map(move |i| self.entity_id(i))
    }

    /// Raw base pointer and stride of a component array.
    pub fn column_ptr(&self, component: ComponentId) -> Option<(*mut u8, u32)> {
        let slot = self.layout.slot(component)?;
        Some((
            unsafe { self.guard.as_ptr().add(slot.base_offset as usize) },
            slot.size,
        ))
    }

    /// The component array for `T`, one element per occupied slot.
    pub fn column<T: Component>(&self) -> Result<&[T]> {
        let id = self.table.id_of::<T>()?;
        let slot = self.layout.slot(id).ok_or(EcsError::MissingComponent)?;
        debug_assert_eq!(slot.size as usize, std::mem::size_of::<T>());
        let ptr = if slot.size == 0 {
            std::ptr::NonNull::<T>::dangling().as_ptr() as *const T
        } else {
            unsafe { self.guard.as_ptr().add(slot.base_offset as usize) as *const T }
        };
        Ok(unsafe { std::slice::from_raw_parts(ptr, self.occupied as usize) })
    }

    /// Mutable component array for `T`.
    ///
    /// Chunk views alias per chunk, never per entity: a chunk is yielded at
    /// most once per iteration, so the usual discipline is one view at a
    /// time per chunk.
    pub fn column_mut<T: Component>(&mut self) -> Result<&mut [T]> {
        let id = self.table.id_of::<T>()?;
        let slot = self.layout.slot(id).ok_or(EcsError::MissingComponent)?;
        debug_assert_eq!(slot.size as usize, std::mem::size_of::<T>());
        let ptr = if slot.size == 0 {
            std::ptr::NonNull::<T>::dangling().as_ptr()
        } else {
            unsafe { self.guard.as_ptr().add(slot.base_offset as usize) as *mut T }
        };
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr, self.occupied as usize) })
    }
}
