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

//! Entity handles, directory locations and the generational id allocator.

use crate::metadata::ArchetypeId;

/// Opaque 64-bit entity handle: version in the high word, id in the low word.
///
/// Version 0 is reserved; a handle carrying it is never alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Entity(u64);

impl Entity {
    /// The never-alive handle.
    pub const INVALID: Entity = Entity(0);

    /// Pack an id and version.
    pub fn new(id: u32, version: u32) -> Self {
        Entity(((version as u64) << 32) | id as u64)
    }

    /// Dense index into the entity directory.
    pub fn id(self) -> u32 {
        self.0 as u32
    }

    /// Generation counter.
    pub fn version(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Raw 64-bit value.
    pub fn to_bits(self) -> u64 {
        self.0
    }

    /// Rebuild from a raw 64-bit value.
    pub fn from_bits(bits: u64) -> Self {
        Entity(bits)
    }
}

/// Where a live entity's data sits.
///
/// `archetype_id == None` means alive but not yet placed in any archetype
/// (the entity carries no components). A slot with version 0 has never held
/// an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityLocation {
    pub version: u32,
    pub archetype_id: Option<ArchetypeId>,
    pub global_index: u32,
}

impl EntityLocation {
    /// A directory slot that has never been used.
    pub const UNINITIALIZED: EntityLocation = EntityLocation {
        version: 0,
        archetype_id: None,
        global_index: 0,
    };

    /// Alive, not placed in any archetype.
    pub fn unplaced(version: u32) -> Self {
        Self {
            version,
            archetype_id: None,
            global_index: 0,
        }
    }
}

/// Generational entity id pool with a free-list.
///
/// The world's structural mutex serializes `create`/`destroy`; liveness
/// probes go through the entity directory and never touch this state.
#[derive(Debug, Default)]
pub struct EntityAllocator {
    versions: Vec<u32>,
    free: Vec<u32>,
    alive: u32,
}

impl EntityAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id the next [`create`](Self::create) will hand out, without mutating.
    pub fn peek_next_id(&self) -> u32 {
        match self.free.last() {
            Some(&id) => id,
            None => self.versions.len() as u32,
        }
    }

    /// Allocate an id and return its handle, version at least 1.
    pub fn create(&mut self) -> Entity {
        self.alive += 1;
        match self.free.pop() {
            Some(id) => {
                // destroy() already advanced the version for reuse.
                Entity::new(id, self.versions[id as usize])
            }
            None => {
                let id = self.versions.len() as u32;
                self.versions.push(1);
                Entity::new(id, 1)
            }
        }
    }

    /// Retire a handle: bump the version (skipping 0 on wrap) and recycle the
    /// id. Stale or invalid handles are a no-op.
    pub fn destroy(&mut self, entity: Entity) {
        let id = entity.id() as usize;
        if entity.version() == 0 || id >= self.versions.len() {
            return;
        }
        if self.versions[id] != entity.version() {
            return;
        }
        let mut next = self.versions[id].wrapping_add(1);
        if next == 0 {
            next = 1;
        }
        self.versions[id] = next;
        self.free.push(entity.id());
        self.alive -= 1;
    }

    /// True while the handle matches the id's current version.
    pub fn is_alive(&self, entity: Entity) -> bool {
        entity.version() != 0
            && (entity.id() as usize) < self.versions.len()
            && self.versions[entity.id() as usize] == entity.version()
    }

    /// Number of live entities.
    pub fn alive_count(&self) -> u32 {
        self.alive
    }

    /// Current version stored for `id`, zero if never allocated.
    pub fn version_of(&self, id: u32) -> u32 {
        self.versions.get(id as usize).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_packing() {
        let e = Entity::new(42, 7);
        assert_eq!(e.id(), 42);
        assert_eq!(e.version(), 7);
        assert_eq!(Entity::from_bits(e.to_bits()), e);
        assert_eq!(Entity::INVALID.version(), 0);
    }

    #[test]
    fn test_fresh_ids_are_dense() {
        let mut alloc = EntityAllocator::new();
        assert_eq!(alloc.peek_next_id(), 0);
        let a = alloc.create();
        let b = alloc.create();
        assert_eq!((a.id(), a.version()), (0, 1));
        assert_eq!((b.id(), b.version()), (1, 1));
        assert_eq!(alloc.alive_count(), 2);
    }

    #[test]
    fn test_reuse_increments_version() {
        let mut alloc = EntityAllocator::new();
        let first = alloc.create();
        alloc.destroy(first);
        assert!(!alloc.is_alive(first));
        assert_eq!(alloc.peek_next_id(), first.id());

        let second = alloc.create();
        assert_eq!(second.id(), first.id());
        assert!(second.version() > first.version());
        assert!(alloc.is_alive(second));
        assert!(!alloc.is_alive(first));
    }

    #[test]
    fn test_destroy_stale_is_noop() {
        let mut alloc = EntityAllocator::new();
        let e = alloc.create();
        alloc.destroy(e);
        let count = alloc.alive_count();
        alloc.destroy(e); // stale now
        alloc.destroy(Entity::INVALID);
        alloc.destroy(Entity::new(999, 3));
        assert_eq!(alloc.alive_count(), count);
    }

    #[test]
    fn test_peek_matches_create() {
        let mut alloc = EntityAllocator::new();
        let a = alloc.create();
        let _b = alloc.create();
        alloc.destroy(a);
        let peeked = alloc.peek_next_id();
        let created = alloc.create();
        assert_eq!(peeked, created.id());
    }

    #[test]
    fn test_version_zero_never_alive() {
        let alloc = EntityAllocator::new();
        assert!(!alloc.is_alive(Entity::new(0, 0)));
    }
}
