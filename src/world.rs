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

//! World: entity directory and orchestrator for structural mutations.
//!
//! All operations take `&self`. Structural mutations (spawn, despawn,
//! add/remove component, the bulk builder variants) serialize on the
//! structural mutex; reads go through the directory's read lock and pin
//! chunks with borrow counts instead. An operation guard counts in-flight
//! calls so `dispose` can drain them before teardown.

use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

#[cfg(feature = "profiling")]
use tracing::info_span;

use crate::builder::ComponentSource;
use crate::chunk::{ChunkAllocator, ChunkHandle};
use crate::component::{Component, ComponentId};
use crate::entity::{Entity, EntityAllocator, EntityLocation};
use crate::error::{EcsError, Result};
use crate::mask::ComponentMask;
use crate::metadata::{ArchetypeId, ArchetypeMetadata};
use crate::store::ArchetypeStore;

/// In-flight operation counter with a disposed flag.
struct OperationGuard {
    active: AtomicUsize,
    disposed: AtomicBool,
}

impl OperationGuard {
    fn new() -> Self {
        Self {
            active: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
        }
    }

    fn enter(&self) -> Result<OpToken<'_>> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(EcsError::Disposed);
        }
        self.active.fetch_add(1, Ordering::AcqRel);
        // dispose() may have flipped the flag between the check and the
        // increment; back out so the drain does not wait on us.
        if self.disposed.load(Ordering::Acquire) {
            self.active.fetch_sub(1, Ordering::AcqRel);
            return Err(EcsError::Disposed);
        }
        Ok(OpToken { guard: self })
    }
}

struct OpToken<'a> {
    guard: &'a OperationGuard,
}

impl Drop for OpToken<'_> {
    fn drop(&mut self) {
        self.guard.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Snapshot of a world's footprint.
#[derive(Debug, Clone, Copy)]
pub struct WorldStats {
    pub alive_entities: u32,
    pub local_archetypes: usize,
    pub chunks_allocated: u32,
    pub chunk_size: u32,
}

/// Central ECS world.
///
/// Worlds sharing an [`ArchetypeMetadata`] mutate independently; the
/// metadata must outlive every world built on it.
pub struct World {
    metadata: Arc<ArchetypeMetadata>,
    allocator: Arc<ChunkAllocator>,

    /// Entity id pool; only touched under the structural mutex.
    entities: Mutex<EntityAllocator>,

    /// `id → EntityLocation`, the sole authority on where entities live.
    directory: RwLock<Vec<EntityLocation>>,

    /// Lazily created per-archetype stores local to this world.
    stores: RwLock<FxHashMap<ArchetypeId, ArchetypeStore>>,

    /// Serializes structural mutations against one another.
    structural: Mutex<()>,

    guard: OperationGuard,
}

impl World {
    /// Create a world with its own chunk allocator.
    pub fn new(metadata: Arc<ArchetypeMetadata>) -> Self {
        let allocator = Arc::new(ChunkAllocator::new(metadata.config()));
        Self::with_allocator(metadata, allocator)
    }

    /// Create a world sharing an existing chunk allocator.
    pub fn with_allocator(metadata: Arc<ArchetypeMetadata>, allocator: Arc<ChunkAllocator>) -> Self {
        let initial = metadata.config().initial_entity_capacity as usize;
        Self {
            metadata,
            allocator,
            entities: Mutex::new(EntityAllocator::new()),
            directory: RwLock::new(vec![EntityLocation::UNINITIALIZED; initial]),
            stores: RwLock::new(FxHashMap::default()),
            structural: Mutex::new(()),
            guard: OperationGuard::new(),
        }
    }

    pub fn metadata(&self) -> &Arc<ArchetypeMetadata> {
        &self.metadata
    }

    pub fn allocator(&self) -> &Arc<ChunkAllocator> {
        &self.allocator
    }

    /// Number of live entities.
    pub fn entity_count(&self) -> u32 {
        self.entities.lock().alive_count()
    }

    // ========== Entity lifecycle ==========

    /// Create a fresh entity with no components.
    pub fn spawn(&self) -> Result<Entity> {
        let _op = self.guard.enter()?;
        let _structural = self.structural.lock();
        self.spawn_locked()
    }

    fn spawn_locked(&self) -> Result<Entity> {
        let mut entities = self.entities.lock();
        let limit = self.metadata.config().max_entity_id();
        if entities.peek_next_id() > limit {
            return Err(EcsError::EntityIdExceedsLimit { limit });
        }
        let entity = entities.create();
        drop(entities);

        let mut directory = self.directory.write();
        Self::ensure_directory_slot(&mut directory, entity.id());
        directory[entity.id() as usize] = EntityLocation::unplaced(entity.version());
        Ok(entity)
    }

    /// Destroy an entity and remove it from its archetype.
    ///
    /// Returns `false` for invalid or stale handles; only `Disposed` is an
    /// error.
    pub fn despawn(&self, entity: Entity) -> Result<bool> {
        let _op = self.guard.enter()?;
        let _structural = self.structural.lock();

        let location = {
            let directory = self.directory.read();
            match directory.get(entity.id() as usize) {
                Some(loc) if entity.version() != 0 && loc.version == entity.version() => *loc,
                _ => return Ok(false),
            }
        };

        if let Some(archetype) = location.archetype_id {
            let mut stores = self.stores.write();
            if let Some(store) = stores.get_mut(&archetype) {
                let moved = store.remove_entity(location.global_index);
                drop(stores);
                if let Some(moved_id) = moved {
                    self.directory.write()[moved_id as usize].global_index = location.global_index;
                }
            }
        }

        let mut entities = self.entities.lock();
        entities.destroy(entity);
        let next_version = entities.version_of(entity.id());
        drop(entities);

        // Invalid location, version advanced: old handles now read as dead.
        self.directory.write()[entity.id() as usize] = EntityLocation {
            version: next_version,
            archetype_id: None,
            global_index: 0,
        };
        Ok(true)
    }

    /// True while the handle matches the directory.
    pub fn is_alive(&self, entity: Entity) -> bool {
        let Ok(_op) = self.guard.enter() else {
            return false;
        };
        if entity.version() == 0 {
            return false;
        }
        let directory = self.directory.read();
        directory
            .get(entity.id() as usize)
            .is_some_and(|loc| loc.version == entity.version())
    }

    /// The entity's directory entry.
    ///
    /// Fails `InvalidEntityHandle` for version-0 or out-of-range handles and
    /// `StaleEntityHandle` on a version mismatch.
    pub fn location_of(&self, entity: Entity) -> Result<EntityLocation> {
        let _op = self.guard.enter()?;
        self.locate(entity)
    }

    fn locate(&self, entity: Entity) -> Result<EntityLocation> {
        if entity.version() == 0 {
            return Err(EcsError::InvalidEntityHandle);
        }
        let directory = self.directory.read();
        let location = directory
            .get(entity.id() as usize)
            .ok_or(EcsError::InvalidEntityHandle)?;
        if location.version != entity.version() {
            return Err(EcsError::StaleEntityHandle);
        }
        Ok(*location)
    }

    /// As [`locate`](Self::locate), but a destroyed entity reports
    /// `EntityNotAlive` (the component-operation contract).
    fn locate_alive(&self, entity: Entity) -> Result<EntityLocation> {
        match self.locate(entity) {
            Err(EcsError::StaleEntityHandle) => Err(EcsError::EntityNotAlive),
            other => other,
        }
    }

    // ========== Component access ==========

    /// Check for component `T` on a live entity.
    pub fn has_component<T: Component>(&self, entity: Entity) -> Result<bool> {
        let _op = self.guard.enter()?;
        let component = self.metadata.table().id_of::<T>()?;
        let location = self.locate_alive(entity)?;
        Ok(match location.archetype_id {
            Some(archetype) => self
                .metadata
                .mask_of(archetype)
                .is_some_and(|mask| mask.get(component.index()).unwrap_or(false)),
            None => false,
        })
    }

    /// Borrow component `T` of `entity` straight out of chunk memory.
    ///
    /// The returned guard pins the chunk: it cannot be freed while the
    /// borrow lives. A concurrent structural change may relocate the entity
    /// between lookup and pin; the read retries and, still contended, falls
    /// back to the structural lock.
    pub fn get_component<T: Component>(&self, entity: Entity) -> Result<ComponentRef<'_, T>> {
        let _op = self.guard.enter()?;
        let component = self.metadata.table().id_of::<T>()?;
        debug_assert_eq!(
            std::mem::size_of::<T>() as u32,
            self.metadata.table().size_of(component),
            "registered size disagrees with the Rust type"
        );

        for _ in 0..3 {
            if let Some(found) = self.try_pin_component(entity, component)? {
                return Ok(Self::component_ref(&self.allocator, found));
            }
        }
        let _structural = self.structural.lock();
        match self.try_pin_component(entity, component)? {
            Some(found) => Ok(Self::component_ref(&self.allocator, found)),
            None => Err(EcsError::EntityNotAlive),
        }
    }

    fn component_ref<T: Component>(
        allocator: &Arc<ChunkAllocator>,
        (handle, ptr): (Option<ChunkHandle>, NonNull<u8>),
    ) -> ComponentRef<'_, T> {
        ComponentRef {
            allocator,
            handle,
            ptr: ptr.cast::<T>(),
            _marker: PhantomData,
        }
    }

    /// Overwrite component `T` in place. Not a structural change.
    pub fn set_component<T: Component>(&self, entity: Entity, value: T) -> Result<()> {
        let _op = self.guard.enter()?;
        let component = self.metadata.table().id_of::<T>()?;

        let write = |(handle, ptr): (Option<ChunkHandle>, NonNull<u8>)| {
            if std::mem::size_of::<T>() > 0 {
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        &value as *const T as *const u8,
                        ptr.as_ptr(),
                        std::mem::size_of::<T>(),
                    );
                }
            }
            if let Some(handle) = handle {
                self.allocator.release(handle);
            }
        };

        for _ in 0..3 {
            if let Some(found) = self.try_pin_component(entity, component)? {
                write(found);
                return Ok(());
            }
        }
        let _structural = self.structural.lock();
        match self.try_pin_component(entity, component)? {
            Some(found) => {
                write(found);
                Ok(())
            }
            None => Err(EcsError::EntityNotAlive),
        }
    }

    /// Resolve `component` of `entity` to a pinned chunk pointer.
    ///
    /// `Err` is definitive (dead entity, missing component). `Ok(None)` is
    /// transient: the location moved or the chunk went stale mid-lookup.
    /// On `Ok(Some((Some(handle), _)))` the caller owns one borrow on the
    /// chunk and must release it. Tags pin nothing and yield a dangling
    /// pointer, valid for zero-sized access only.
    fn try_pin_component(
        &self,
        entity: Entity,
        component: ComponentId,
    ) -> Result<Option<(Option<ChunkHandle>, NonNull<u8>)>> {
        let location = self.locate_alive(entity)?;
        let Some(archetype) = location.archetype_id else {
            return Err(EcsError::MissingComponent);
        };

        let (chunk, offset) = {
            let stores = self.stores.read();
            let store = stores.get(&archetype).ok_or(EcsError::MissingComponent)?;
            let layout = store.layout();
            let slot = layout.slot(component).ok_or(EcsError::MissingComponent)?;
            if slot.size == 0 {
                return Ok(Some((None, NonNull::dangling())));
            }
            let (chunk_index, index_in_chunk) = store.get_chunk_location(location.global_index);
            let chunk = match store.get_chunk(chunk_index) {
                Some(chunk) => chunk,
                None => return Ok(None),
            };
            (chunk, slot.base_offset + index_in_chunk * slot.size)
        };

        if !self.allocator.acquire(chunk) {
            return Ok(None);
        }
        // The entity may have migrated between the lookup and the pin.
        match self.locate_alive(entity) {
            Ok(now) if now == location => {}
            _ => {
                self.allocator.release(chunk);
                return Ok(None);
            }
        }
        let base = match self.allocator.data_ptr(chunk) {
            Some(base) => base,
            None => {
                self.allocator.release(chunk);
                return Ok(None);
            }
        };
        let ptr = unsafe { NonNull::new_unchecked(base.as_ptr().add(offset as usize)) };
        Ok(Some((Some(chunk), ptr)))
    }

    // ========== Structural mutations ==========

    /// Add component `T` with `value`, migrating the entity to the target
    /// archetype through the cached add edge.
    pub fn add_component<T: Component>(&self, entity: Entity, value: T) -> Result<()> {
        let _op = self.guard.enter()?;
        let component = self.metadata.table().id_of::<T>()?;
        let _structural = self.structural.lock();

        #[cfg(feature = "profiling")]
        let span = info_span!("world.add_component", entity = entity.id());
        #[cfg(feature = "profiling")]
        let _span_guard = span.enter();

        let location = self.locate_alive(entity)?;
        let value_bytes = value_bytes(&value);

        match location.archetype_id {
            None => {
                let mask = self.component_mask_single(component)?;
                let (archetype, _) = self.metadata.get_or_create_archetype(&mask)?;
                let global_index = self.place_entity(archetype, entity)?;
                self.write_component_bytes(archetype, global_index, component, value_bytes)?;
                self.directory.write()[entity.id() as usize] = EntityLocation {
                    version: entity.version(),
                    archetype_id: Some(archetype),
                    global_index,
                };
                Ok(())
            }
            Some(source) => {
                let already = self
                    .metadata
                    .mask_of(source)
                    .is_some_and(|mask| mask.get(component.index()).unwrap_or(false));
                if already {
                    return Err(EcsError::DuplicateComponent);
                }
                let target = self.metadata.get_or_create_with_add(source, component)?;
                let global_index = self.migrate(entity, location, source, target)?;
                self.write_component_bytes(target, global_index, component, value_bytes)?;
                Ok(())
            }
        }
    }

    /// Remove component `T`, migrating through the cached remove edge.
    ///
    /// Removing the last component leaves the entity alive but unplaced.
    pub fn remove_component<T: Component>(&self, entity: Entity) -> Result<()> {
        let _op = self.guard.enter()?;
        let component = self.metadata.table().id_of::<T>()?;
        let _structural = self.structural.lock();

        let location = self.locate_alive(entity)?;
        let Some(source) = location.archetype_id else {
            return Err(EcsError::MissingComponent);
        };
        let has = self
            .metadata
            .mask_of(source)
            .is_some_and(|mask| mask.get(component.index()).unwrap_or(false));
        if !has {
            return Err(EcsError::MissingComponent);
        }

        let target = self.metadata.get_or_create_with_remove(source, component)?;
        let target_empty = self
            .metadata
            .mask_of(target)
            .is_some_and(ComponentMask::is_empty);

        if target_empty {
            // No physical archetype for the empty set: unplace the entity.
            self.remove_from_archetype(entity, location, source);
            Ok(())
        } else {
            self.migrate(entity, location, source, target)?;
            Ok(())
        }
    }

    /// Spawn an entity carrying the source's whole component set in one
    /// structural move.
    pub fn create_entity(&self, source: &impl ComponentSource) -> Result<Entity> {
        let _op = self.guard.enter()?;
        let _structural = self.structural.lock();

        let mut mask = self.metadata.table().empty_mask();
        source.collect_types(&mut mask)?;
        if mask.is_empty() {
            return self.spawn_locked();
        }

        let (archetype, _) = self.metadata.get_or_create_archetype(&mask)?;

        // Reserve the slot against the peeked id first: a failed chunk
        // allocation must not leak a created entity.
        let mut entities = self.entities.lock();
        let limit = self.metadata.config().max_entity_id();
        let next_id = entities.peek_next_id();
        if next_id > limit {
            return Err(EcsError::EntityIdExceedsLimit { limit });
        }
        let global_index = self.place_with_source(archetype, next_id, source)?;
        let entity = entities.create();
        debug_assert_eq!(entity.id(), next_id);
        drop(entities);

        let mut directory = self.directory.write();
        Self::ensure_directory_slot(&mut directory, entity.id());
        directory[entity.id() as usize] = EntityLocation {
            version: entity.version(),
            archetype_id: Some(archetype),
            global_index,
        };
        Ok(entity)
    }

    /// Add every component the source carries in a single migration.
    ///
    /// Fails `DuplicateComponent` if any of them is already present.
    pub fn add_components(&self, entity: Entity, source: &impl ComponentSource) -> Result<()> {
        let _op = self.guard.enter()?;
        let _structural = self.structural.lock();

        let location = self.locate_alive(entity)?;
        let mut added = self.metadata.table().empty_mask();
        source.collect_types(&mut added)?;
        if added.is_empty() {
            return Ok(());
        }

        match location.archetype_id {
            None => {
                let (archetype, _) = self.metadata.get_or_create_archetype(&added)?;
                let global_index = self.place_with_source(archetype, entity.id(), source)?;
                self.directory.write()[entity.id() as usize] = EntityLocation {
                    version: entity.version(),
                    archetype_id: Some(archetype),
                    global_index,
                };
                Ok(())
            }
            Some(current) => {
                let current_mask = self
                    .metadata
                    .mask_of(current)
                    .cloned()
                    .unwrap_or_default();
                if current_mask.contains_any(&added) {
                    return Err(EcsError::DuplicateComponent);
                }
                let (target, _) = self
                    .metadata
                    .get_or_create_archetype(&current_mask.or(&added))?;
                let global_index = self.migrate(entity, location, current, target)?;
                self.write_with_source(target, global_index, source)?;
                Ok(())
            }
        }
    }

    /// Replace the entity's entire component set with the source's.
    pub fn overwrite(&self, entity: Entity, source: &impl ComponentSource) -> Result<()> {
        let _op = self.guard.enter()?;
        let _structural = self.structural.lock();

        let location = self.locate_alive(entity)?;
        let mut mask = self.metadata.table().empty_mask();
        source.collect_types(&mut mask)?;

        if mask.is_empty() {
            if let Some(source_archetype) = location.archetype_id {
                self.remove_from_archetype(entity, location, source_archetype);
            }
            return Ok(());
        }

        let (target, _) = self.metadata.get_or_create_archetype(&mask)?;
        match location.archetype_id {
            Some(current) if current == target => {
                // Same archetype: rewrite values in place.
                self.write_with_source(target, location.global_index, source)
            }
            Some(current) => {
                let global_index = self.migrate(entity, location, current, target)?;
                self.write_with_source(target, global_index, source)
            }
            None => {
                let global_index = self.place_with_source(target, entity.id(), source)?;
                self.directory.write()[entity.id() as usize] = EntityLocation {
                    version: entity.version(),
                    archetype_id: Some(target),
                    global_index,
                };
                Ok(())
            }
        }
    }

    // ========== Teardown ==========

    /// Refuse new operations and wait for in-flight ones to drain.
    pub fn dispose(&self) {
        if self.guard.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        while self.guard.active.load(Ordering::Acquire) != 0 {
            std::thread::yield_now();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.guard.disposed.load(Ordering::Acquire)
    }

    /// Footprint snapshot.
    pub fn stats(&self) -> WorldStats {
        let allocator_stats = self.allocator.stats();
        WorldStats {
            alive_entities: self.entities.lock().alive_count(),
            local_archetypes: self.stores.read().len(),
            chunks_allocated: allocator_stats.allocated,
            chunk_size: allocator_stats.chunk_size,
        }
    }

    // ========== Internals ==========

    fn component_mask_single(&self, component: ComponentId) -> Result<ComponentMask> {
        let mut mask = self.metadata.table().empty_mask();
        mask.set(component.index())?;
        Ok(mask)
    }

    /// Grow to `max(double, id + 1)` slots; growth is invisible to callers.
    fn ensure_directory_slot(directory: &mut Vec<EntityLocation>, id: u32) {
        let needed = id as usize + 1;
        if directory.len() < needed {
            let target = needed.max(directory.len() * 2);
            directory.resize(target, EntityLocation::UNINITIALIZED);
        }
    }

    fn ensure_store<'a>(
        stores: &'a mut FxHashMap<ArchetypeId, ArchetypeStore>,
        metadata: &ArchetypeMetadata,
        allocator: &Arc<ChunkAllocator>,
        archetype: ArchetypeId,
    ) -> &'a mut ArchetypeStore {
        stores.entry(archetype).or_insert_with(|| {
            let layout = metadata
                .layout_of(archetype)
                .unwrap_or_else(|| panic!("unknown archetype id {}", archetype.0));
            ArchetypeStore::new(archetype, layout, Arc::clone(allocator))
        })
    }

    /// Allocate a slot for `entity` in `archetype` (no directory update).
    fn place_entity(&self, archetype: ArchetypeId, entity: Entity) -> Result<u32> {
        let mut stores = self.stores.write();
        let store = Self::ensure_store(&mut stores, &self.metadata, &self.allocator, archetype);
        store.allocate_entity(entity.id())
    }

    /// Allocate a slot for `entity_id` and let the source write its
    /// components (no directory update).
    fn place_with_source(
        &self,
        archetype: ArchetypeId,
        entity_id: u32,
        source: &impl ComponentSource,
    ) -> Result<u32> {
        let mut stores = self.stores.write();
        let store = Self::ensure_store(&mut stores, &self.metadata, &self.allocator, archetype);
        let global_index = store.allocate_entity(entity_id)?;
        let (chunk_index, index_in_chunk) = store.get_chunk_location(global_index);
        let chunk = store
            .get_chunk(chunk_index)
            .ok_or(EcsError::StaleChunkHandle)?;
        let base = self
            .allocator
            .data_ptr(chunk)
            .ok_or(EcsError::StaleChunkHandle)?;
        unsafe {
            source.write_components(store.layout(), base.as_ptr(), index_in_chunk);
        }
        Ok(global_index)
    }

    /// Let the source rewrite its components at an existing slot.
    fn write_with_source(
        &self,
        archetype: ArchetypeId,
        global_index: u32,
        source: &impl ComponentSource,
    ) -> Result<()> {
        let stores = self.stores.read();
        let store = stores
            .get(&archetype)
            .ok_or(EcsError::MissingComponent)?;
        let (chunk_index, index_in_chunk) = store.get_chunk_location(global_index);
        let chunk = store
            .get_chunk(chunk_index)
            .ok_or(EcsError::StaleChunkHandle)?;
        let base = self
            .allocator
            .data_ptr(chunk)
            .ok_or(EcsError::StaleChunkHandle)?;
        unsafe {
            source.write_components(store.layout(), base.as_ptr(), index_in_chunk);
        }
        Ok(())
    }

    /// Write one component's bytes at an existing slot.
    fn write_component_bytes(
        &self,
        archetype: ArchetypeId,
        global_index: u32,
        component: ComponentId,
        bytes: &[u8],
    ) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let stores = self.stores.read();
        let store = stores
            .get(&archetype)
            .ok_or(EcsError::MissingComponent)?;
        let (chunk_index, index_in_chunk) = store.get_chunk_location(global_index);
        let chunk = store
            .get_chunk(chunk_index)
            .ok_or(EcsError::StaleChunkHandle)?;
        let base = self
            .allocator
            .data_ptr(chunk)
            .ok_or(EcsError::StaleChunkHandle)?;
        let offset = store
            .layout()
            .offset(component, index_in_chunk)
            .ok_or(EcsError::MissingComponent)?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                base.as_ptr().add(offset as usize),
                bytes.len(),
            );
        }
        Ok(())
    }

    /// Move `entity` from `source` to `target`, §-protocol order: allocate
    /// in the target, copy shared bytes, swap-remove the source slot, patch
    /// the moved entity, update the directory. A failure before the
    /// swap-remove leaves the source untouched; everything after it is
    /// infallible.
    fn migrate(
        &self,
        entity: Entity,
        location: EntityLocation,
        source: ArchetypeId,
        target: ArchetypeId,
    ) -> Result<u32> {
        #[cfg(feature = "profiling")]
        let span = info_span!(
            "world.migrate",
            entity = entity.id(),
            from = source.0,
            to = target.0
        );
        #[cfg(feature = "profiling")]
        let _span_guard = span.enter();

        let mut stores = self.stores.write();
        Self::ensure_store(&mut stores, &self.metadata, &self.allocator, target);

        let target_index = stores
            .get_mut(&target)
            .ok_or(EcsError::MissingComponent)?
            .allocate_entity(entity.id())?;

        {
            let source_store = stores.get(&source).ok_or(EcsError::MissingComponent)?;
            let target_store = stores.get(&target).ok_or(EcsError::MissingComponent)?;
            self.copy_shared_components(
                source_store,
                location.global_index,
                target_store,
                target_index,
            );
        }

        // Linearization point: from here on nothing can fail.
        let moved = stores
            .get_mut(&source)
            .and_then(|store| store.remove_entity(location.global_index));
        drop(stores);

        let mut directory = self.directory.write();
        if let Some(moved_id) = moved {
            directory[moved_id as usize].global_index = location.global_index;
        }
        directory[entity.id() as usize] = EntityLocation {
            version: entity.version(),
            archetype_id: Some(target),
            global_index: target_index,
        };
        Ok(target_index)
    }

    /// Copy every non-tag component present in both layouts from the source
    /// slot to the target slot.
    fn copy_shared_components(
        &self,
        source: &ArchetypeStore,
        source_global: u32,
        target: &ArchetypeStore,
        target_global: u32,
    ) {
        let (src_chunk_index, src_index) = source.get_chunk_location(source_global);
        let (dst_chunk_index, dst_index) = target.get_chunk_location(target_global);
        let (Some(src_chunk), Some(dst_chunk)) = (
            source.get_chunk(src_chunk_index),
            target.get_chunk(dst_chunk_index),
        ) else {
            return;
        };
        let (Some(src_base), Some(dst_base)) = (
            self.allocator.data_ptr(src_chunk),
            self.allocator.data_ptr(dst_chunk),
        ) else {
            return;
        };

        let source_layout = source.layout();
        for slot in target.layout().slots() {
            if slot.size == 0 {
                continue;
            }
            let Some(src_offset) = source_layout.offset(slot.component_id, src_index) else {
                continue;
            };
            let dst_offset = slot.base_offset + dst_index * slot.size;
            unsafe {
                std::ptr::copy_nonoverlapping(
                    src_base.as_ptr().add(src_offset as usize),
                    dst_base.as_ptr().add(dst_offset as usize),
                    slot.size as usize,
                );
            }
        }
    }

    /// Remove the entity from its archetype and mark it alive-but-unplaced.
    fn remove_from_archetype(
        &self,
        entity: Entity,
        location: EntityLocation,
        archetype: ArchetypeId,
    ) {
        let mut stores = self.stores.write();
        let moved = stores
            .get_mut(&archetype)
            .and_then(|store| store.remove_entity(location.global_index));
        drop(stores);

        let mut directory = self.directory.write();
        if let Some(moved_id) = moved {
            directory[moved_id as usize].global_index = location.global_index;
        }
        directory[entity.id() as usize] = EntityLocation::unplaced(entity.version());
    }

    /// Snapshot of an archetype's chunk list for query iteration.
    pub(crate) fn chunk_snapshot(
        &self,
        archetype: ArchetypeId,
    ) -> Option<(Arc<crate::layout::ArchetypeLayout>, smallvec::SmallVec<[ChunkHandle; 4]>, u32)>
    {
        let stores = self.stores.read();
        let store = stores.get(&archetype)?;
        Some((
            Arc::clone(store.layout()),
            smallvec::SmallVec::from_slice(store.chunks()),
            store.entity_count(),
        ))
    }
}

fn value_bytes<T>(value: &T) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(value as *const T as *const u8, std::mem::size_of::<T>())
    }
}

/// Borrow of one component inside a pinned chunk.
///
/// Holding it keeps the chunk alive; drop it promptly to let structural
/// changes trim chunks.
pub struct ComponentRef<'w, T> {
    allocator: &'w Arc<ChunkAllocator>,
    handle: Option<ChunkHandle>,
    ptr: NonNull<T>,
    _marker: PhantomData<&'w T>,
}

impl<T> Deref for ComponentRef<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> Drop for ComponentRef<'_, T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle {
            self.allocator.release(handle);
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for ComponentRef<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        (**self).fmt(f)
    }
}
