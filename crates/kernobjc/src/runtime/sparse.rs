//! Two-level sparse array keyed by 16-bit selector ids.
//!
//! Both the selector index (id -> entry) and every per-class dispatch cache
//! (id -> method) are keyed by selector id. Ids are dense from 1 upwards but a
//! single class only caches a handful of them, so a flat array per class
//! would waste memory. Instead the id is split into a high byte that picks a
//! leaf and a low byte that picks a slot inside it. Leaves are allocated on
//! first write and published with a CAS; reads never lock.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

const LEAF_BITS: u32 = 8;
const LEAF_SIZE: usize = 1 << LEAF_BITS;
const LEAF_MASK: usize = LEAF_SIZE - 1;
const ROOT_SIZE: usize = (u16::MAX as usize >> LEAF_BITS) + 1;

/// A slot type with a well-defined empty state.
pub(crate) trait EmptySlot {
    fn empty() -> Self;
}

impl<T> EmptySlot for AtomicPtr<T> {
    fn empty() -> Self {
        AtomicPtr::new(ptr::null_mut())
    }
}

struct Leaf<S> {
    slots: [S; LEAF_SIZE],
}

/// Sparse map from `u16` to a slot `S`.
///
/// The array owns its leaves but not whatever the slots point at.
pub(crate) struct SparseArray<S: EmptySlot> {
    roots: Box<[AtomicPtr<Leaf<S>>]>,
}

impl<S: EmptySlot> SparseArray<S> {
    pub(crate) fn new() -> Self {
        let roots = (0..ROOT_SIZE)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        SparseArray { roots }
    }

    #[inline]
    const fn split(index: u16) -> (usize, usize) {
        let index = index as usize;
        (index >> LEAF_BITS, index & LEAF_MASK)
    }

    /// Returns the slot for `index` if its leaf exists.
    #[inline]
    pub(crate) fn slot(&self, index: u16) -> Option<&S> {
        let (root, leaf) = Self::split(index);
        let leaf_ptr = self.roots[root].load(Ordering::Acquire);
        if leaf_ptr.is_null() {
            return None;
        }
        // SAFETY: published leaves stay alive until the array is dropped.
        Some(unsafe { &(*leaf_ptr).slots[leaf] })
    }

    /// Returns the slot for `index`, allocating its leaf if needed.
    pub(crate) fn slot_or_insert(&self, index: u16) -> &S {
        let (root, leaf) = Self::split(index);
        let mut leaf_ptr = self.roots[root].load(Ordering::Acquire);

        if leaf_ptr.is_null() {
            let fresh = Box::into_raw(Box::new(Leaf {
                slots: std::array::from_fn(|_| S::empty()),
            }));
            match self.roots[root].compare_exchange(
                ptr::null_mut(),
                fresh,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => leaf_ptr = fresh,
                Err(winner) => {
                    // SAFETY: fresh was never published.
                    drop(unsafe { Box::from_raw(fresh) });
                    leaf_ptr = winner;
                }
            }
        }

        // SAFETY: leaf_ptr is a published leaf, alive until drop.
        unsafe { &(*leaf_ptr).slots[leaf] }
    }

    /// Visits every slot in every allocated leaf.
    pub(crate) fn for_each_slot(&self, mut f: impl FnMut(&S)) {
        for root in self.roots.iter() {
            let leaf_ptr = root.load(Ordering::Acquire);
            if leaf_ptr.is_null() {
                continue;
            }
            // SAFETY: published leaves stay alive until the array is dropped.
            let leaf = unsafe { &*leaf_ptr };
            leaf.slots.iter().for_each(&mut f);
        }
    }
}

impl<S: EmptySlot> Drop for SparseArray<S> {
    fn drop(&mut self) {
        for root in self.roots.iter_mut() {
            let leaf_ptr = *root.get_mut();
            if !leaf_ptr.is_null() {
                // SAFETY: every non-null root came from Box::into_raw and we
                // have exclusive access.
                drop(unsafe { Box::from_raw(leaf_ptr) });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    struct Counter(AtomicUsize);

    impl EmptySlot for Counter {
        fn empty() -> Self {
            Counter(AtomicUsize::new(0))
        }
    }

    #[test]
    fn test_missing_leaf_reads_none() {
        let array: SparseArray<Counter> = SparseArray::new();
        assert!(array.slot(0).is_none());
        assert!(array.slot(u16::MAX).is_none());
    }

    #[test]
    fn test_insert_and_read_back() {
        let array: SparseArray<Counter> = SparseArray::new();
        array.slot_or_insert(300).0.store(5, Ordering::SeqCst);

        assert_eq!(array.slot(300).unwrap().0.load(Ordering::SeqCst), 5);
        // Same leaf, untouched slot.
        assert_eq!(array.slot(301).unwrap().0.load(Ordering::SeqCst), 0);
        // Different leaf.
        assert!(array.slot(3).is_none());
    }

    #[test]
    fn test_for_each_visits_allocated_leaves() {
        let array: SparseArray<Counter> = SparseArray::new();
        array.slot_or_insert(1);
        array.slot_or_insert(1000);

        let mut visited = 0;
        array.for_each_slot(|_| visited += 1);
        assert_eq!(visited, 2 * LEAF_SIZE);
    }

    #[test]
    fn test_concurrent_leaf_creation() {
        let array: Arc<SparseArray<Counter>> = Arc::new(SparseArray::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let array = Arc::clone(&array);
                std::thread::spawn(move || {
                    array.slot_or_insert(4242).0.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(array.slot(4242).unwrap().0.load(Ordering::SeqCst), 8);
    }
}
