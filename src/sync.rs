//! Lock-free append-only list.
//!
//! Backs the archetype-layout table and per-query match lists: a single
//! writer (the create-lock holder) appends, any number of readers iterate
//! concurrently. Publication is a release store of the length; readers
//! acquire-load it, so an index that is visible is fully initialized.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

/// Bounded append-only vector with wait-free reads.
///
/// Capacity is fixed at construction; the metadata sizes these from the
/// configured maxima so a full list surfaces as a capacity error upstream.
pub struct AppendOnlyVec<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    len: AtomicUsize,
    writer: Mutex<()>,
}

// Readers hand out &T across threads; writers move T in.
unsafe impl<T: Send> Send for AppendOnlyVec<T> {}
unsafe impl<T: Send + Sync> Sync for AppendOnlyVec<T> {}

impl<T> AppendOnlyVec<T> {
    /// Create with room for `capacity` elements.
    pub fn with_capacity(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            len: AtomicUsize::new(0),
            writer: Mutex::new(()),
        }
    }

    /// Published length.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// True if nothing has been published.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fixed capacity.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Append a value, returning its index, or the value back when full.
    pub fn push(&self, value: T) -> std::result::Result<usize, T> {
        let _guard = self.writer.lock();
        let index = self.len.load(Ordering::Relaxed);
        if index >= self.slots.len() {
            return Err(value);
        }
        // Initialize the slot before publishing the new length.
        unsafe {
            (*self.slots[index].get()).write(value);
        }
        self.len.store(index + 1, Ordering::Release);
        Ok(index)
    }

    /// Read a published element.
    pub fn get(&self, index: usize) -> Option<&T> {
        if index >= self.len() {
            return None;
        }
        // Publication order guarantees the slot is initialized.
        Some(unsafe { (*self.slots[index].get()).assume_init_ref() })
    }

    /// Iterate the elements published at call time.
    ///
    /// Elements appended during iteration are not yielded; the snapshot is
    /// the length observed here.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let snapshot = self.len();
        (0..snapshot).map(move |i| {
            // Within the snapshot, every slot is initialized.
            unsafe { (*self.slots[i].get()).assume_init_ref() }
        })
    }
}

impl<T> Drop for AppendOnlyVec<T> {
    fn drop(&mut self) {
        let len = *self.len.get_mut();
        for slot in &mut self.slots[..len] {
            unsafe {
                slot.get_mut().assume_init_drop();
            }
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for AppendOnlyVec<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}
