//! Instance variable records and layout.

use crate::runtime::class::{Class, ClassInner};
use kernobjc_mem::metadata_arena;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Largest ivar alignment an instance allocation can honour.
pub const MAX_IVAR_ALIGNMENT: usize = 16;

/// Size of the object header (the `isa` word) that precedes root ivars.
pub const HEADER_SIZE: usize = std::mem::size_of::<usize>();

pub(crate) struct IvarInner {
    name: &'static str,
    types: &'static str,
    size: usize,
    alignment: usize,
    offset: AtomicUsize,
    owner: NonNull<ClassInner>,
}

/// Handle to an instance variable of a class.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ivar {
    inner: NonNull<IvarInner>,
}

// SAFETY: ivar records live in the metadata arena forever; the offset is
// written once, under the class's ivar lock, before the class is finished.
unsafe impl Send for Ivar {}
// SAFETY: see above.
unsafe impl Sync for Ivar {}

impl Ivar {
    pub(crate) fn new(
        owner: Class,
        name: &str,
        size: usize,
        alignment: usize,
        types: &str,
    ) -> Ivar {
        let arena = metadata_arena();
        let inner = arena.alloc(IvarInner {
            name: arena.alloc_str(name),
            types: arena.alloc_str(types),
            size,
            alignment,
            offset: AtomicUsize::new(0),
            owner: owner.inner_ptr(),
        });
        Ivar {
            inner: NonNull::from(inner),
        }
    }

    #[inline]
    fn inner(&self) -> &IvarInner {
        // SAFETY: ivar records are arena allocated and never freed.
        unsafe { self.inner.as_ref() }
    }

    /// The ivar name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.inner().name
    }

    /// The type signature given at declaration.
    #[must_use]
    pub fn type_encoding(&self) -> &'static str {
        self.inner().types
    }

    /// Size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner().size
    }

    /// Alignment in bytes.
    #[must_use]
    pub fn alignment(&self) -> usize {
        self.inner().alignment
    }

    /// Byte offset from the start of the instance. Meaningful once the
    /// owning class is finished.
    #[inline]
    #[must_use]
    pub fn offset(&self) -> usize {
        self.inner().offset.load(Ordering::Acquire)
    }

    /// The class that declared this ivar.
    #[must_use]
    pub fn owner(&self) -> Class {
        // SAFETY: owners are arena-allocated classes.
        unsafe { Class::from_inner(self.inner().owner) }
    }
}

impl fmt::Debug for Ivar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ivar")
            .field("name", &self.name())
            .field("types", &self.type_encoding())
            .field("size", &self.size())
            .field("offset", &self.offset())
            .finish()
    }
}

#[inline]
pub(crate) const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Assigns offsets to `ivars` in declaration order starting at `start`, and
/// returns the instance size: the end of the last ivar rounded up to
/// pointer alignment.
pub(crate) fn layout_ivars(start: usize, ivars: &[Ivar]) -> usize {
    let mut end = start;
    for ivar in ivars {
        let offset = align_up(end, ivar.alignment());
        ivar.inner().offset.store(offset, Ordering::Release);
        end = offset + ivar.size();
    }
    align_up(end, std::mem::align_of::<usize>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(13, 4), 16);
        assert_eq!(align_up(13, 1), 13);
    }

    #[test]
    fn test_layout_packs_in_declaration_order() {
        let class = Class::new_root("LayoutProbe");
        let flag = Ivar::new(class, "flag", 1, 1, "C");
        let count = Ivar::new(class, "count", 4, 4, "i");
        let wide = Ivar::new(class, "wide", 8, 8, "q");

        let size = layout_ivars(HEADER_SIZE, &[flag, count, wide]);

        assert_eq!(flag.offset(), HEADER_SIZE);
        assert_eq!(count.offset(), align_up(HEADER_SIZE + 1, 4));
        assert_eq!(wide.offset(), align_up(count.offset() + 4, 8));
        assert_eq!(size, align_up(wide.offset() + 8, std::mem::align_of::<usize>()));
        assert_eq!(flag.owner(), class);
    }

    #[test]
    fn test_empty_layout_keeps_start() {
        assert_eq!(layout_ivars(HEADER_SIZE, &[]), HEADER_SIZE);
    }
}
