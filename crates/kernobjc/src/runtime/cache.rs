//! Per-class dispatch cache.
//!
//! Maps selector id to the method a send resolved to. Only found methods are
//! cached, never misses. Each slot records the method's version at fill time;
//! a probe whose method has moved on to a newer version is a miss.
//!
//! Probes and fills are lock-free. A slot's method and version are written
//! under a per-slot sequence counter: a fill makes it odd while it writes,
//! and a probe that sees it odd or changed treats the slot as a miss. A fill
//! that finds another fill in progress gives up, since filling is optional.

use crate::runtime::method::{Method, MethodInner};
use crate::runtime::selector::SelectorId;
use crate::runtime::sparse::{EmptySlot, SparseArray};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering, fence};

pub(crate) struct CacheSlot {
    seq: AtomicU32,
    method: AtomicPtr<MethodInner>,
    version: AtomicU32,
}

impl EmptySlot for CacheSlot {
    fn empty() -> Self {
        CacheSlot {
            seq: AtomicU32::new(0),
            method: AtomicPtr::new(ptr::null_mut()),
            version: AtomicU32::new(0),
        }
    }
}

pub(crate) struct DispatchCache {
    slots: SparseArray<CacheSlot>,
}

impl DispatchCache {
    pub(crate) fn new() -> Self {
        DispatchCache {
            slots: SparseArray::new(),
        }
    }

    #[inline]
    pub(crate) fn probe(&self, selector: SelectorId) -> Option<Method> {
        let slot = self.slots.slot(selector.as_u16())?;
        let seq = slot.seq.load(Ordering::Acquire);
        if seq & 1 != 0 {
            return None;
        }
        let raw = slot.method.load(Ordering::Acquire);
        let version = slot.version.load(Ordering::Acquire);
        fence(Ordering::Acquire);
        if slot.seq.load(Ordering::Relaxed) != seq {
            return None;
        }
        // SAFETY: only pointers from Method::as_ptr are stored.
        let method = unsafe { Method::from_ptr(raw) }?;
        if version != method.version() {
            return None;
        }
        Some(method)
    }

    /// Caches `method` as it was at `version`.
    ///
    /// `version` must have been read before the lookup that produced
    /// `method` was confirmed, so a bump racing with the lookup leaves a
    /// slot that misses rather than one that hits forever.
    pub(crate) fn fill(&self, selector: SelectorId, method: Method, version: u32) {
        let slot = self.slots.slot_or_insert(selector.as_u16());
        let seq = slot.seq.load(Ordering::Relaxed);
        if seq & 1 != 0
            || slot
                .seq
                .compare_exchange(seq, seq.wrapping_add(1), Ordering::Acquire, Ordering::Relaxed)
                .is_err()
        {
            return;
        }
        fence(Ordering::Release);
        slot.method.store(method.as_ptr(), Ordering::Relaxed);
        slot.version.store(version, Ordering::Relaxed);
        slot.seq.store(seq.wrapping_add(2), Ordering::Release);
    }

    pub(crate) fn evict(&self, selector: SelectorId) {
        if let Some(slot) = self.slots.slot(selector.as_u16()) {
            slot.method.store(ptr::null_mut(), Ordering::Release);
        }
    }

    pub(crate) fn flush(&self) {
        self.slots
            .for_each_slot(|slot| slot.method.store(ptr::null_mut(), Ordering::Release));
    }

    pub(crate) fn len(&self) -> usize {
        let mut count = 0;
        self.slots.for_each_slot(|slot| {
            if !slot.method.load(Ordering::Acquire).is_null() {
                count += 1;
            }
        });
        count
    }
}
