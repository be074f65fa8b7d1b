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

//! Shared archetype metadata: the interning hub.
//!
//! Owns every archetype layout, the mask→id map, the add/remove edge cache
//! and the query registry. Shared by every world built on it and must
//! outlive them all. Archetypes are never destroyed, which keeps ids stable
//! in the edge and query caches.
//!
//! Concurrency: lookups take only a map read lock; creation serializes on a
//! single create-lock and re-checks under it. The archetype list and query
//! match lists publish through [`AppendOnlyVec`], so readers iterating them
//! never block a writer and vice versa.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;

#[cfg(feature = "profiling")]
use tracing::debug;

use crate::component::{ComponentId, ComponentTypeTable};
use crate::config::EcsConfig;
use crate::error::{EcsError, Result};
use crate::layout::ArchetypeLayout;
use crate::mask::ComponentMask;
use crate::sync::AppendOnlyVec;

/// Dense archetype identifier, stable for the metadata's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArchetypeId(pub u32);

impl ArchetypeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Dense query identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryId(pub u32);

impl QueryId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Cached transition in the archetype graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct EdgeKey {
    archetype: ArchetypeId,
    component: ComponentId,
    add: bool,
}

/// Immutable query predicate: all/any/none component masks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct QueryPredicate {
    pub all: ComponentMask,
    pub any: ComponentMask,
    pub none: ComponentMask,
}

impl QueryPredicate {
    /// `mask ⊇ all ∧ (any = ∅ ∨ mask ∩ any ≠ ∅) ∧ mask ∩ none = ∅`
    pub fn matches(&self, mask: &ComponentMask) -> bool {
        mask.contains_all(&self.all)
            && (self.any.is_empty() || mask.contains_any(&self.any))
            && mask.contains_none(&self.none)
    }
}

/// Mask map key carrying its hash so interning never rehashes the words.
#[derive(Debug, Clone)]
struct MaskKey {
    mask: ComponentMask,
    hash: u64,
}

impl PartialEq for MaskKey {
    fn eq(&self, other: &Self) -> bool {
        self.mask == other.mask
    }
}

impl Eq for MaskKey {}

impl Hash for MaskKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

/// One interned archetype: mask + shared layout.
#[derive(Debug)]
pub struct ArchetypeInfo {
    pub id: ArchetypeId,
    pub mask: ComponentMask,
    pub layout: Arc<ArchetypeLayout>,
}

/// One interned query predicate with its incrementally maintained matches.
#[derive(Debug)]
pub struct QueryData {
    pub id: QueryId,
    pub predicate: QueryPredicate,
    matches: AppendOnlyVec<ArchetypeId>,
}

impl QueryData {
    /// Archetypes matched so far. Safe to iterate while the create-lock
    /// holder appends.
    pub fn matches(&self) -> &AppendOnlyVec<ArchetypeId> {
        &self.matches
    }
}

/// The shared interning hub (thread-safe).
pub struct ArchetypeMetadata {
    config: EcsConfig,
    table: Arc<ComponentTypeTable>,
    mask_hasher: ahash::RandomState,
    mask_to_id: RwLock<AHashMap<MaskKey, ArchetypeId>>,
    archetypes: AppendOnlyVec<ArchetypeInfo>,
    edges: RwLock<AHashMap<EdgeKey, ArchetypeId>>,
    predicate_to_query: RwLock<AHashMap<QueryPredicate, QueryId>>,
    queries: AppendOnlyVec<QueryData>,
    create_lock: Mutex<()>,
}

impl ArchetypeMetadata {
    /// Build the hub for a validated configuration and a frozen type table.
    pub fn new(config: EcsConfig, table: Arc<ComponentTypeTable>) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            mask_to_id: RwLock::new(AHashMap::with_capacity(64)),
            archetypes: AppendOnlyVec::with_capacity(config.max_archetypes as usize),
            edges: RwLock::new(AHashMap::with_capacity(128)),
            predicate_to_query: RwLock::new(AHashMap::with_capacity(32)),
            queries: AppendOnlyVec::with_capacity(config.max_queries as usize),
            create_lock: Mutex::new(()),
            mask_hasher: ahash::RandomState::new(),
            table,
            config,
        }))
    }

    pub fn config(&self) -> &EcsConfig {
        &self.config
    }

    pub fn table(&self) -> &Arc<ComponentTypeTable> {
        &self.table
    }

    pub fn archetype_count(&self) -> usize {
        self.archetypes.len()
    }

    pub fn query_count(&self) -> usize {
        self.queries.len()
    }

    /// Interned archetype by id.
    pub fn archetype(&self, id: ArchetypeId) -> Option<&ArchetypeInfo> {
        self.archetypes.get(id.index())
    }

    /// Layout for an archetype id.
    pub fn layout_of(&self, id: ArchetypeId) -> Option<Arc<ArchetypeLayout>> {
        self.archetype(id).map(|info| Arc::clone(&info.layout))
    }

    /// Mask for an archetype id.
    pub fn mask_of(&self, id: ArchetypeId) -> Option<&ComponentMask> {
        self.archetype(id).map(|info| &info.mask)
    }

    fn mask_key(&self, mask: &ComponentMask) -> MaskKey {
        MaskKey {
            hash: self.mask_hasher.hash_one(mask),
            mask: mask.clone(),
        }
    }

    /// Id for an already interned mask, no locking beyond the map read.
    pub fn get_archetype_id(&self, mask: &ComponentMask) -> Option<ArchetypeId> {
        let key = self.mask_key(mask);
        self.mask_to_id.read().get(&key).copied()
    }

    /// Intern `mask`, returning its archetype id and every interned query
    /// whose predicate matches it.
    ///
    /// Fast path never touches the create-lock; the slow path serializes on
    /// it, re-checks, then publishes list-first so any id reachable through
    /// the map is fully initialized.
    pub fn get_or_create_archetype(
        &self,
        mask: &ComponentMask,
    ) -> Result<(ArchetypeId, SmallVec<[QueryId; 4]>)> {
        let key = self.mask_key(mask);
        if let Some(&id) = self.mask_to_id.read().get(&key) {
            return Ok((id, self.queries_matching(mask)));
        }

        let _create = self.create_lock.lock();
        if let Some(&id) = self.mask_to_id.read().get(&key) {
            return Ok((id, self.queries_matching(mask)));
        }

        if self.archetypes.len() >= self.config.max_archetypes as usize {
            return Err(EcsError::ArchetypeIdLimitExceeded {
                limit: self.config.max_archetypes,
            });
        }

        let id = ArchetypeId(self.archetypes.len() as u32);
        let layout = Arc::new(ArchetypeLayout::new(
            mask.clone(),
            &self.table,
            self.config.chunk_size,
            self.config.entity_id_width.bytes(),
        ));
        self.archetypes
            .push(ArchetypeInfo {
                id,
                mask: mask.clone(),
                layout,
            })
            .map_err(|_| EcsError::ArchetypeIdLimitExceeded {
                limit: self.config.max_archetypes,
            })?;

        let mut matched = SmallVec::new();
        for query in self.queries.iter() {
            if query.predicate.matches(mask) {
                // Match lists share the archetype bound, so this cannot fill.
                let _ = query.matches.push(id);
                matched.push(query.id);
            }
        }

        self.mask_to_id.write().insert(key, id);

        #[cfg(feature = "profiling")]
        debug!(
            archetype = id.0,
            components = mask.popcount(),
            queries = matched.len(),
            "archetype created"
        );

        Ok((id, matched))
    }

    fn queries_matching(&self, mask: &ComponentMask) -> SmallVec<[QueryId; 4]> {
        self.queries
            .iter()
            .filter(|q| q.predicate.matches(mask))
            .map(|q| q.id)
            .collect()
    }

    /// Target of adding `component` to `src`, through the edge cache.
    ///
    /// The slow path interns the target mask and caches both the forward add
    /// edge and the reverse remove edge. Fails `InvalidArchetypeHandle` when
    /// `src` is not an interned archetype.
    pub fn get_or_create_with_add(
        &self,
        src: ArchetypeId,
        component: ComponentId,
    ) -> Result<ArchetypeId> {
        self.get_or_create_edge(src, component, true)
    }

    /// Target of removing `component` from `src`; symmetric to the add edge.
    pub fn get_or_create_with_remove(
        &self,
        src: ArchetypeId,
        component: ComponentId,
    ) -> Result<ArchetypeId> {
        self.get_or_create_edge(src, component, false)
    }

    fn get_or_create_edge(
        &self,
        src: ArchetypeId,
        component: ComponentId,
        add: bool,
    ) -> Result<ArchetypeId> {
        let key = EdgeKey {
            archetype: src,
            component,
            add,
        };
        if let Some(&tgt) = self.edges.read().get(&key) {
            return Ok(tgt);
        }

        let src_mask = self
            .mask_of(src)
            .cloned()
            .ok_or(EcsError::InvalidArchetypeHandle)?;
        let single = ComponentMask::single(component.index())?;
        let tgt_mask = if add {
            src_mask.or(&single)
        } else {
            src_mask.and_not(&single)
        };
        let (tgt, _) = self.get_or_create_archetype(&tgt_mask)?;

        let mut edges = self.edges.write();
        edges.insert(key, tgt);
        // Reverse edge cached eagerly: the add/remove round-trip then hits
        // the fast path in both directions.
        if tgt != src {
            edges.insert(
                EdgeKey {
                    archetype: tgt,
                    component,
                    add: !add,
                },
                src,
            );
        }
        Ok(tgt)
    }

    /// Intern a predicate; first insertion seeds the match list from every
    /// existing archetype.
    pub fn get_or_create_query(&self, predicate: QueryPredicate) -> Result<QueryId> {
        if let Some(&id) = self.predicate_to_query.read().get(&predicate) {
            return Ok(id);
        }

        let _create = self.create_lock.lock();
        if let Some(&id) = self.predicate_to_query.read().get(&predicate) {
            return Ok(id);
        }

        if self.queries.len() >= self.config.max_queries as usize {
            return Err(EcsError::QueryLimitExceeded {
                limit: self.config.max_queries,
            });
        }

        let id = QueryId(self.queries.len() as u32);
        let data = QueryData {
            id,
            predicate: predicate.clone(),
            matches: AppendOnlyVec::with_capacity(self.config.max_archetypes as usize),
        };
        for info in self.archetypes.iter() {
            if data.predicate.matches(&info.mask) {
                let _ = data.matches.push(info.id);
            }
        }
        self.queries
            .push(data)
            .map_err(|_| EcsError::QueryLimitExceeded {
                limit: self.config.max_queries,
            })?;
        self.predicate_to_query.write().insert(predicate, id);

        #[cfg(feature = "profiling")]
        debug!(query = id.0, "query interned");

        Ok(id)
    }

    /// Query data by id.
    pub fn query(&self, id: QueryId) -> Option<&QueryData> {
        self.queries.get(id.index())
    }

    /// The append-only match list for a query; readable during appends.
    pub fn matched_archetype_ids(&self, id: QueryId) -> Option<&AppendOnlyVec<ArchetypeId>> {
        self.query(id).map(QueryData::matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_table() -> Arc<ComponentTypeTable> {
        let mut b = ComponentTypeTable::builder();
        b.register_raw(12, 4, None); // 0
        b.register_raw(12, 4, None); // 1
        b.register_raw(4, 4, None); // 2
        b.build()
    }

    fn metadata() -> Arc<ArchetypeMetadata> {
        ArchetypeMetadata::new(EcsConfig::default(), test_table()).unwrap()
    }

    fn mask_of(bits: &[usize]) -> ComponentMask {
        let mut m = ComponentMask::with_capacity(64);
        for &b in bits {
            m.set(b).unwrap();
        }
        m
    }

    #[test]
    fn test_interning_is_idempotent() {
        let meta = metadata();
        let (a, _) = meta.get_or_create_archetype(&mask_of(&[0, 1])).unwrap();
        let (b, _) = meta.get_or_create_archetype(&mask_of(&[0, 1])).unwrap();
        let (c, _) = meta.get_or_create_archetype(&mask_of(&[0])).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(meta.archetype_count(), 2);
        assert_eq!(meta.get_archetype_id(&mask_of(&[0, 1])), Some(a));
    }

    #[test]
    fn test_add_edge_and_reverse() {
        let meta = metadata();
        let (src, _) = meta.get_or_create_archetype(&mask_of(&[0])).unwrap();
        let tgt = meta.get_or_create_with_add(src, ComponentId(1)).unwrap();
        assert_eq!(
            meta.mask_of(tgt).unwrap().iter().collect::<Vec<_>>(),
            vec![0, 1]
        );
        // Reverse edge must already be cached and round-trip.
        let back = meta.get_or_create_with_remove(tgt, ComponentId(1)).unwrap();
        assert_eq!(back, src);
        // Cached: repeated calls agree.
        assert_eq!(meta.get_or_create_with_add(src, ComponentId(1)).unwrap(), tgt);
    }

    #[test]
    fn test_edge_with_bogus_ids_errors() {
        let meta = metadata();
        // An archetype id that was never interned must not panic.
        assert_eq!(
            meta.get_or_create_with_add(ArchetypeId(999_999), ComponentId(0))
                .unwrap_err(),
            EcsError::InvalidArchetypeHandle
        );
        // Nor a component id no mask can represent.
        let (src, _) = meta.get_or_create_archetype(&mask_of(&[0])).unwrap();
        assert!(matches!(
            meta.get_or_create_with_add(src, ComponentId(u32::MAX))
                .unwrap_err(),
            EcsError::MaskIndexOutOfRange { .. }
        ));
    }

    #[test]
    fn test_remove_to_empty_mask() {
        let meta = metadata();
        let (src, _) = meta.get_or_create_archetype(&mask_of(&[2])).unwrap();
        let tgt = meta.get_or_create_with_remove(src, ComponentId(2)).unwrap();
        assert!(meta.mask_of(tgt).unwrap().is_empty());
    }

    #[test]
    fn test_query_seeded_from_existing_archetypes() {
        let meta = metadata();
        let (a, _) = meta.get_or_create_archetype(&mask_of(&[0])).unwrap();
        let (ab, _) = meta.get_or_create_archetype(&mask_of(&[0, 1])).unwrap();

        let query = meta
            .get_or_create_query(QueryPredicate {
                all: mask_of(&[0]),
                any: ComponentMask::with_capacity(64),
                none: mask_of(&[1]),
            })
            .unwrap();

        let matches: Vec<ArchetypeId> =
            meta.matched_archetype_ids(query).unwrap().iter().copied().collect();
        assert_eq!(matches, vec![a]);
        let _ = ab;
    }

    #[test]
    fn test_query_updated_on_archetype_creation() {
        let meta = metadata();
        let query = meta
            .get_or_create_query(QueryPredicate {
                all: mask_of(&[0]),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(meta.matched_archetype_ids(query).unwrap().len(), 0);

        let (a, matched) = meta.get_or_create_archetype(&mask_of(&[0, 2])).unwrap();
        assert_eq!(matched.to_vec(), vec![query]);
        let matches: Vec<ArchetypeId> =
            meta.matched_archetype_ids(query).unwrap().iter().copied().collect();
        assert_eq!(matches, vec![a]);

        // Non-matching archetype leaves the list alone.
        let (_, matched) = meta.get_or_create_archetype(&mask_of(&[1])).unwrap();
        assert!(matched.is_empty());
        assert_eq!(meta.matched_archetype_ids(query).unwrap().len(), 1);
    }

    #[test]
    fn test_any_and_none_semantics() {
        let pred = QueryPredicate {
            all: mask_of(&[0]),
            any: mask_of(&[1, 2]),
            none: ComponentMask::with_capacity(64),
        };
        assert!(pred.matches(&mask_of(&[0, 1])));
        assert!(pred.matches(&mask_of(&[0, 2])));
        assert!(!pred.matches(&mask_of(&[0])));
        assert!(!pred.matches(&mask_of(&[1, 2])));

        let empty_any = QueryPredicate {
            all: mask_of(&[0]),
            ..Default::default()
        };
        assert!(empty_any.matches(&mask_of(&[0])));
    }

    #[test]
    fn test_archetype_id_limit() {
        let config = EcsConfig {
            max_archetypes: 2,
            ..Default::default()
        };
        let meta = ArchetypeMetadata::new(config, test_table()).unwrap();
        meta.get_or_create_archetype(&mask_of(&[0])).unwrap();
        meta.get_or_create_archetype(&mask_of(&[1])).unwrap();
        assert_eq!(
            meta.get_or_create_archetype(&mask_of(&[2])).unwrap_err(),
            EcsError::ArchetypeIdLimitExceeded { limit: 2 }
        );
        // Existing masks still resolve.
        assert!(meta.get_or_create_archetype(&mask_of(&[0])).is_ok());
    }

    #[test]
    fn test_query_interning_idempotent() {
        let meta = metadata();
        let pred = QueryPredicate {
            all: mask_of(&[0, 1]),
            ..Default::default()
        };
        let a = meta.get_or_create_query(pred.clone()).unwrap();
        let b = meta.get_or_create_query(pred).unwrap();
        assert_eq!(a, b);
        assert_eq!(meta.query_count(), 1);
    }

    #[test]
    fn test_matched_queries_on_fast_path() {
        let meta = metadata();
        let (_, matched) = meta.get_or_create_archetype(&mask_of(&[0])).unwrap();
        assert!(matched.is_empty());

        let query = meta
            .get_or_create_query(QueryPredicate {
                all: mask_of(&[0]),
                ..Default::default()
            })
            .unwrap();

        // Fast path (mask already interned) still reports matching queries.
        let (_, matched) = meta.get_or_create_archetype(&mask_of(&[0])).unwrap();
        assert_eq!(matched.to_vec(), vec![query]);
    }
}
