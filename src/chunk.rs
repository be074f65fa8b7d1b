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

//! Fixed-size chunk allocator with generational handles.
//!
//! Chunks are pooled byte buffers of one configured size. A [`ChunkHandle`]
//! is `(slot, version)`; freeing a slot bumps its version so every prior
//! handle goes stale. Borrow counts pin a chunk against freeing while readers
//! hold it.
//!
//! Allocate/free serialize on an internal mutex. Slot lookup, `acquire`,
//! `release` and buffer access only take the slab-list read lock: slabs are
//! boxed and append-only, so slot references stay valid for the allocator's
//! lifetime even while the slab list grows.

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::config::EcsConfig;
use crate::error::{EcsError, Result};

const SLAB_LEN: usize = 64;

/// Chunk buffers are cache-line aligned so every in-chunk offset the layout
/// aligns is also aligned in memory.
const CHUNK_ALIGN: usize = 64;

/// Generational handle to one chunk slot. Version 0 is never valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkHandle {
    slot: u32,
    version: u32,
}

impl ChunkHandle {
    /// The never-valid handle.
    pub const INVALID: ChunkHandle = ChunkHandle {
        slot: u32::MAX,
        version: 0,
    };

    /// Slot index.
    pub fn slot(self) -> u32 {
        self.slot
    }

    /// Generation counter.
    pub fn version(self) -> u32 {
        self.version
    }

    /// False for the invalid handle; stale handles still report true here.
    pub fn is_valid(self) -> bool {
        self.version != 0
    }
}

struct ChunkSlot {
    version: AtomicU32,
    borrows: AtomicU32,
    buf: AtomicPtr<u8>,
}

impl ChunkSlot {
    fn new() -> Self {
        Self {
            version: AtomicU32::new(1),
            borrows: AtomicU32::new(0),
            buf: AtomicPtr::new(std::ptr::null_mut()),
        }
    }
}

struct AllocState {
    free: Vec<u32>,
    slot_count: u32,
    allocated: u32,
}

/// Allocator statistics snapshot.
#[derive(Debug, Clone, Copy)]
pub struct AllocatorStats {
    pub chunk_size: u32,
    pub allocated: u32,
    pub free: u32,
    pub slot_count: u32,
}

/// Pool of fixed-size chunks addressed by generational handles.
pub struct ChunkAllocator {
    chunk_size: u32,
    max_chunks: u32,
    slabs: RwLock<Vec<Box<[ChunkSlot]>>>,
    state: Mutex<AllocState>,
}

impl ChunkAllocator {
    /// Create an allocator for `config.chunk_size`-byte chunks, reserving
    /// `config.initial_chunk_capacity` slots up front (buffers stay lazy).
    pub fn new(config: &EcsConfig) -> Self {
        let reserved = config.initial_chunk_capacity.min(config.max_chunks);
        let slab_count = (reserved as usize).div_ceil(SLAB_LEN);
        let mut slabs = Vec::with_capacity(slab_count.max(1));
        for _ in 0..slab_count {
            slabs.push(new_slab());
        }
        let slot_count = (slab_count * SLAB_LEN).min(config.max_chunks as usize) as u32;
        // Pop order hands out low indices first.
        let free: Vec<u32> = (0..slot_count).rev().collect();
        Self {
            chunk_size: config.chunk_size,
            max_chunks: config.max_chunks,
            slabs: RwLock::new(slabs),
            state: Mutex::new(AllocState {
                free,
                slot_count,
                allocated: 0,
            }),
        }
    }

    /// Configured chunk size in bytes.
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    fn slot(&self, index: u32) -> Option<&ChunkSlot> {
        let slabs = self.slabs.read();
        let slab = slabs.get(index as usize / SLAB_LEN)?;
        let slot: *const ChunkSlot = &slab[index as usize % SLAB_LEN];
        // Slabs are boxed and only ever appended while the allocator lives,
        // so the reference stays valid after the guard drops.
        Some(unsafe { &*slot })
    }

    fn buffer_layout(&self) -> Layout {
        // chunk_size is validated to a power of two >= 256, so this cannot
        // fail.
        Layout::from_size_align(self.chunk_size as usize, CHUNK_ALIGN)
            .expect("chunk size fits a layout")
    }

    /// Allocate a zero-initialized chunk.
    ///
    /// Grows the slot table as needed up to the configured maximum, then
    /// fails with `ChunkCapacityExceeded`.
    pub fn allocate(&self) -> Result<ChunkHandle> {
        let mut state = self.state.lock();
        let index = match state.free.pop() {
            Some(index) => index,
            None => {
                if state.slot_count >= self.max_chunks {
                    return Err(EcsError::ChunkCapacityExceeded {
                        limit: self.max_chunks,
                    });
                }
                let index = state.slot_count;
                if index as usize % SLAB_LEN == 0 {
                    self.slabs.write().push(new_slab());
                }
                state.slot_count += 1;
                index
            }
        };

        let slot = self.slot(index).expect("free-listed slot exists");
        let ptr = slot.buf.load(Ordering::Acquire);
        if ptr.is_null() {
            let layout = self.buffer_layout();
            let fresh = unsafe { alloc_zeroed(layout) };
            if fresh.is_null() {
                handle_alloc_error(layout);
            }
            slot.buf.store(fresh, Ordering::Release);
        } else {
            // Pooled buffer: re-zero before handing it out again.
            unsafe { std::ptr::write_bytes(ptr, 0, self.chunk_size as usize) };
        }

        state.allocated += 1;
        Ok(ChunkHandle {
            slot: index,
            version: slot.version.load(Ordering::SeqCst),
        })
    }

    /// Release a slot, staling every outstanding handle to it.
    ///
    /// Fails with `ChunkInUse` while the borrow count is non-zero. Freeing an
    /// already-stale handle is an idempotent no-op. The buffer is retained
    /// for reuse.
    pub fn free(&self, handle: ChunkHandle) -> Result<()> {
        let mut state = self.state.lock();
        let Some(slot) = self.slot(handle.slot) else {
            return Ok(());
        };
        if slot.version.load(Ordering::SeqCst) != handle.version {
            return Ok(());
        }

        // Bump the version before inspecting borrows so no new borrow can
        // slip in between the check and the free.
        let mut next = handle.version.wrapping_add(1);
        if next == 0 {
            next = 1;
        }
        slot.version.store(next, Ordering::SeqCst);

        if slot.borrows.load(Ordering::SeqCst) != 0 {
            slot.version.store(handle.version, Ordering::SeqCst);
            return Err(EcsError::ChunkInUse);
        }

        state.allocated -= 1;
        state.free.push(handle.slot);
        Ok(())
    }

    /// Atomically take a borrow on the chunk if the handle is current.
    pub fn acquire(&self, handle: ChunkHandle) -> bool {
        if !handle.is_valid() {
            return false;
        }
        let Some(slot) = self.slot(handle.slot) else {
            return false;
        };
        if slot.version.load(Ordering::SeqCst) != handle.version {
            return false;
        }
        slot.borrows.fetch_add(1, Ordering::SeqCst);
        if slot.version.load(Ordering::SeqCst) == handle.version {
            return true;
        }
        // The slot was freed between the check and the increment; back out.
        slot.borrows.fetch_sub(1, Ordering::SeqCst);
        false
    }

    /// Drop a borrow taken with [`acquire`](Self::acquire).
    pub fn release(&self, handle: ChunkHandle) {
        if let Some(slot) = self.slot(handle.slot) {
            slot.borrows.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Raw buffer pointer for a current handle; `None` when stale.
    ///
    /// The pointer stays valid until the chunk is freed. Callers either hold
    /// a borrow or the owning world's structural lock.
    pub fn data_ptr(&self, handle: ChunkHandle) -> Option<NonNull<u8>> {
        if !handle.is_valid() {
            return None;
        }
        let slot = self.slot(handle.slot)?;
        if slot.version.load(Ordering::SeqCst) != handle.version {
            return None;
        }
        NonNull::new(slot.buf.load(Ordering::Acquire))
    }

    /// Borrow the chunk behind a RAII guard, or `None` for stale handles.
    pub fn acquire_guard(&self, handle: ChunkHandle) -> Option<ChunkGuard<'_>> {
        if !self.acquire(handle) {
            return None;
        }
        match self.data_ptr(handle) {
            Some(ptr) => Some(ChunkGuard {
                alloc: self,
                handle,
                ptr,
            }),
            None => {
                self.release(handle);
                None
            }
        }
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> AllocatorStats {
        let state = self.state.lock();
        AllocatorStats {
            chunk_size: self.chunk_size,
            allocated: state.allocated,
            free: state.free.len() as u32,
            slot_count: state.slot_count,
        }
    }
}

fn new_slab() -> Box<[ChunkSlot]> {
    (0..SLAB_LEN)
        .map(|_| ChunkSlot::new())
        .collect::<Vec<_>>()
        .into_boxed_slice()
}

impl Drop for ChunkAllocator {
    fn drop(&mut self) {
        let layout = self.buffer_layout();
        for slab in self.slabs.get_mut().iter_mut() {
            for slot in slab.iter_mut() {
                let ptr = *slot.buf.get_mut();
                if !ptr.is_null() {
                    unsafe { dealloc(ptr, layout) };
                }
            }
        }
    }
}

/// RAII chunk borrow: the chunk cannot be freed while the guard lives.
pub struct ChunkGuard<'a> {
    alloc: &'a ChunkAllocator,
    handle: ChunkHandle,
    ptr: NonNull<u8>,
}

impl ChunkGuard<'_> {
    /// The borrowed handle.
    pub fn handle(&self) -> ChunkHandle {
        self.handle
    }

    /// Base pointer of the chunk buffer.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// The chunk bytes.
    ///
    /// Concurrent structural writes touch other slots of the chunk; reading a
    /// slot that is mutated at the same time is the caller's race to manage.
    pub fn bytes(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(self.ptr.as_ptr(), self.alloc.chunk_size as usize)
        }
    }
}

impl Drop for ChunkGuard<'_> {
    fn drop(&mut self) {
        self.alloc.release(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_allocator(max_chunks: u32) -> ChunkAllocator {
        ChunkAllocator::new(&EcsConfig {
            chunk_size: 1024,
            max_chunks,
            initial_chunk_capacity: 0,
            ..Default::default()
        })
    }

    #[test]
    fn test_allocate_zeroed_and_stable() {
        let alloc = test_allocator(16);
        let h = alloc.allocate().unwrap();
        let ptr = alloc.data_ptr(h).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 1024) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_free_stales_handle() {
        let alloc = test_allocator(16);
        let h = alloc.allocate().unwrap();
        alloc.free(h).unwrap();
        assert!(alloc.data_ptr(h).is_none());
        assert!(!alloc.acquire(h));
        // Idempotent
        alloc.free(h).unwrap();
    }

    #[test]
    fn test_reuse_bumps_version_and_rezeros() {
        let alloc = test_allocator(16);
        let first = alloc.allocate().unwrap();
        unsafe {
            std::ptr::write_bytes(alloc.data_ptr(first).unwrap().as_ptr(), 0xAB, 1024);
        }
        alloc.free(first).unwrap();

        let second = alloc.allocate().unwrap();
        assert_eq!(first.slot(), second.slot());
        assert_ne!(first.version(), second.version());
        let bytes = unsafe {
            std::slice::from_raw_parts(alloc.data_ptr(second).unwrap().as_ptr(), 1024)
        };
        assert!(bytes.iter().all(|&b| b == 0));
        // The old handle stays stale even though the slot is live again.
        assert!(alloc.data_ptr(first).is_none());
    }

    #[test]
    fn test_borrow_pins_against_free() {
        let alloc = test_allocator(16);
        let h = alloc.allocate().unwrap();
        assert!(alloc.acquire(h));
        assert_eq!(alloc.free(h), Err(EcsError::ChunkInUse));
        // Still live
        assert!(alloc.data_ptr(h).is_some());
        alloc.release(h);
        alloc.free(h).unwrap();
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let alloc = test_allocator(16);
        let h = alloc.allocate().unwrap();
        {
            let guard = alloc.acquire_guard(h).unwrap();
            assert_eq!(guard.bytes().len(), 1024);
            assert_eq!(alloc.free(h), Err(EcsError::ChunkInUse));
        }
        alloc.free(h).unwrap();
    }

    #[test]
    fn test_capacity_exceeded() {
        let alloc = test_allocator(2);
        let a = alloc.allocate().unwrap();
        let _b = alloc.allocate().unwrap();
        assert_eq!(
            alloc.allocate(),
            Err(EcsError::ChunkCapacityExceeded { limit: 2 })
        );
        alloc.free(a).unwrap();
        assert!(alloc.allocate().is_ok());
    }

    #[test]
    fn test_stats() {
        let alloc = test_allocator(8);
        let h = alloc.allocate().unwrap();
        let stats = alloc.stats();
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.chunk_size, 1024);
        alloc.free(h).unwrap();
        assert_eq!(alloc.stats().allocated, 0);
        assert_eq!(alloc.stats().free, 1);
    }
}
