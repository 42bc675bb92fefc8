//! Heap instances and the receiver sum type.
//!
//! An instance is a zeroed allocation that starts with an `isa` word naming
//! its class, followed by the ivars laid out by
//! [`Class::finish`](crate::runtime::class::Class::finish), followed by any
//! extra bytes requested at allocation (indexed ivars).
//!
//! Every allocation carries a hidden prefix recording its total size so that
//! [`Object::dispose`] can free it without consulting the class, which may
//! have been swapped with [`Object::set_class`] in the meantime.
//!
//! ```text
//!   base                      object pointer
//!   |                         |
//!   v                         v
//!   [ size | pad ][ isa | ivars ... | indexed ivars ... ]
//!    PREFIX bytes   instance_size     extra
//! ```
//!
//! A [`Receiver`] is what dispatch operates on: nil, a [`SmallObject`], or a
//! heap [`Object`]. All word-level decoding lives in [`Receiver::from_word`].

use crate::error::{Error, Result};
use crate::runtime::abort::OrAbort;
use crate::runtime::class::{Class, ClassInner};
use crate::runtime::ivar::{HEADER_SIZE, Ivar, MAX_IVAR_ALIGNMENT};
use crate::runtime::tagged::SmallObject;
use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

const ALLOC_ALIGN: usize = MAX_IVAR_ALIGNMENT;
const PREFIX: usize = ALLOC_ALIGN;

/// The first word of every object, classes included.
#[repr(C)]
pub(crate) struct ObjectHeader {
    isa: AtomicPtr<ClassInner>,
}

/// Handle to a heap instance (or to a class viewed as an object).
///
/// Handles are plain pointers: they do not keep the instance alive and
/// copying one does not copy the instance.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Object {
    ptr: NonNull<ObjectHeader>,
}

// SAFETY: the isa word is atomic. Ivar access goes through unsafe methods
// whose callers take on synchronisation.
unsafe impl Send for Object {}
// SAFETY: see above.
unsafe impl Sync for Object {}

impl Object {
    /// Allocates a zeroed instance of `class`. Aborts if the class is
    /// unfinished or memory is exhausted.
    #[must_use]
    pub fn allocate(class: Class) -> Object {
        Self::try_allocate(class, 0).or_abort()
    }

    /// Allocates a zeroed instance of `class` with `extra` bytes of indexed
    /// ivars after the declared ivars.
    ///
    /// # Errors
    ///
    /// - [`Error::ClassNotFinished`] if `class` is still in construction
    /// - [`Error::OutOfMemory`] if the allocation fails
    pub fn try_allocate(class: Class, extra: usize) -> Result<Object> {
        let size = class
            .try_instance_size()?
            .checked_add(extra)
            .ok_or(Error::OutOfMemory)?;
        let object = Self::allocate_bytes(size)?;
        object.header().isa.store(class.as_ptr(), Ordering::Release);
        Ok(object)
    }

    fn allocate_bytes(size: usize) -> Result<Object> {
        let size = size.max(HEADER_SIZE);
        let total = size.checked_add(PREFIX).ok_or(Error::OutOfMemory)?;
        let layout = Layout::from_size_align(total, ALLOC_ALIGN).map_err(|_| Error::OutOfMemory)?;

        // SAFETY: layout has a non-zero size.
        let base = unsafe { alloc::alloc_zeroed(layout) };
        if base.is_null() {
            return Err(Error::OutOfMemory);
        }

        // SAFETY: base is ALLOC_ALIGN aligned and at least PREFIX + size
        // bytes long.
        unsafe {
            base.cast::<usize>().write(total);
            let ptr = NonNull::new_unchecked(base.add(PREFIX)).cast::<ObjectHeader>();
            Ok(Object { ptr })
        }
    }

    /// # Safety
    ///
    /// `header` must point at a live isa word.
    pub(crate) unsafe fn from_header(header: NonNull<ObjectHeader>) -> Object {
        Object { ptr: header }
    }

    #[inline]
    fn header(&self) -> &ObjectHeader {
        // SAFETY: handles only exist for live objects.
        unsafe { self.ptr.as_ref() }
    }

    /// The instance's class.
    #[inline]
    #[must_use]
    pub fn class(&self) -> Class {
        let isa = self.header().isa.load(Ordering::Acquire);
        // SAFETY: isa always holds a pointer from Class::as_ptr.
        unsafe { Class::from_inner(NonNull::new_unchecked(isa)) }
    }

    /// Changes the instance's class and returns the previous one.
    ///
    /// The new class should have a compatible layout; nothing checks that.
    pub fn set_class(&self, class: Class) -> Class {
        let old = self.header().isa.swap(class.as_ptr(), Ordering::AcqRel);
        // SAFETY: see class().
        unsafe { Class::from_inner(NonNull::new_unchecked(old)) }
    }

    /// Pointer to the storage of `ivar`.
    #[inline]
    #[must_use]
    pub fn ivar_ptr(&self, ivar: Ivar) -> NonNull<u8> {
        debug_assert!(
            self.class().is_subclass_of(ivar.owner()),
            "ivar {} does not belong to class {}",
            ivar.name(),
            self.class().name()
        );
        // SAFETY: offsets lie inside the instance of any subclass of the
        // declaring class.
        unsafe { self.ptr.cast::<u8>().add(ivar.offset()) }
    }

    /// Reads `ivar` as a `T`.
    ///
    /// # Safety
    ///
    /// The instance must belong to a subclass of the ivar's class, the ivar
    /// bytes must be a valid `T`, and no other thread may be writing them.
    ///
    /// # Panics
    ///
    /// Panics if `T` is larger than the ivar.
    #[must_use]
    pub unsafe fn get_ivar<T: Copy>(&self, ivar: Ivar) -> T {
        assert!(
            std::mem::size_of::<T>() <= ivar.size(),
            "ivar {} is {} bytes, cannot read {} bytes",
            ivar.name(),
            ivar.size(),
            std::mem::size_of::<T>()
        );
        // SAFETY: in bounds per the assert; the caller vouches for validity.
        unsafe { self.ivar_ptr(ivar).cast::<T>().as_ptr().read_unaligned() }
    }

    /// Writes `value` into `ivar`.
    ///
    /// # Safety
    ///
    /// The instance must belong to a subclass of the ivar's class and no
    /// other thread may be accessing the ivar.
    ///
    /// # Panics
    ///
    /// Panics if `T` is larger than the ivar.
    pub unsafe fn set_ivar<T: Copy>(&self, ivar: Ivar, value: T) {
        assert!(
            std::mem::size_of::<T>() <= ivar.size(),
            "ivar {} is {} bytes, cannot write {} bytes",
            ivar.name(),
            ivar.size(),
            std::mem::size_of::<T>()
        );
        // SAFETY: in bounds per the assert.
        unsafe {
            self.ivar_ptr(ivar)
                .cast::<T>()
                .as_ptr()
                .write_unaligned(value);
        }
    }

    /// Reads the ivar called `name`, looked up on the instance's class.
    ///
    /// # Safety
    ///
    /// Same as [`get_ivar`](Self::get_ivar).
    #[must_use]
    pub unsafe fn get_ivar_named<T: Copy>(&self, name: &str) -> Option<T> {
        let ivar = self.class().ivar(name)?;
        // SAFETY: forwarded to the caller.
        Some(unsafe { self.get_ivar(ivar) })
    }

    /// Writes the ivar called `name` and returns it, or `None` if the
    /// instance's class has no such ivar.
    ///
    /// # Safety
    ///
    /// Same as [`set_ivar`](Self::set_ivar).
    pub unsafe fn set_ivar_named<T: Copy>(&self, name: &str, value: T) -> Option<Ivar> {
        let ivar = self.class().ivar(name)?;
        // SAFETY: forwarded to the caller.
        unsafe { self.set_ivar(ivar, value) };
        Some(ivar)
    }

    /// Total bytes of the instance, from the hidden prefix.
    ///
    /// # Safety
    ///
    /// `self` must come from [`allocate`](Self::allocate),
    /// [`try_allocate`](Self::try_allocate) or [`copy`](Self::copy).
    #[must_use]
    pub unsafe fn allocation_size(&self) -> usize {
        // SAFETY: the caller guarantees the prefix exists.
        unsafe { self.base().cast::<usize>().read() - PREFIX }
    }

    /// The indexed ivar bytes reserved by
    /// [`try_allocate`](Self::try_allocate).
    ///
    /// # Safety
    ///
    /// Same as [`allocation_size`](Self::allocation_size); additionally the
    /// returned slice must not outlive the instance or alias another live
    /// reference to the same bytes.
    #[must_use]
    pub unsafe fn indexed_ivars<'a>(&self) -> &'a mut [u8] {
        // SAFETY: forwarded to the caller.
        let size = unsafe { self.allocation_size() };
        let start = self.class().instance_size().min(size);
        // SAFETY: [start, size) lies inside the allocation.
        unsafe {
            std::slice::from_raw_parts_mut(self.ptr.cast::<u8>().as_ptr().add(start), size - start)
        }
    }

    /// Allocates a new instance of `size` bytes and copies the first `size`
    /// bytes of this one into it, `isa` included.
    ///
    /// # Safety
    ///
    /// `self` must have at least `size` readable bytes and no thread may be
    /// writing them during the copy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the allocation fails.
    pub unsafe fn copy(&self, size: usize) -> Result<Object> {
        let copy = Self::allocate_bytes(size)?;
        let len = size.max(HEADER_SIZE);
        // SAFETY: both regions hold at least len bytes and do not overlap.
        unsafe {
            ptr::copy_nonoverlapping(
                self.ptr.cast::<u8>().as_ptr(),
                copy.ptr.cast::<u8>().as_ptr(),
                len,
            );
        }
        Ok(copy)
    }

    /// Frees the instance.
    ///
    /// # Safety
    ///
    /// Same as [`allocation_size`](Self::allocation_size). The handle and
    /// every copy of it are dangling afterwards.
    pub unsafe fn dispose(self) {
        // SAFETY: the caller guarantees the prefix exists.
        unsafe {
            let base = self.base();
            let total = base.cast::<usize>().read();
            alloc::dealloc(base, Layout::from_size_align_unchecked(total, ALLOC_ALIGN));
        }
    }

    fn base(&self) -> *mut u8 {
        self.ptr.cast::<u8>().as_ptr().wrapping_sub(PREFIX)
    }

    /// The instance pointer as a machine word.
    #[inline]
    #[must_use]
    pub fn as_word(&self) -> usize {
        self.ptr.as_ptr().addr()
    }

    /// Rebuilds a handle from [`as_word`](Self::as_word).
    ///
    /// # Safety
    ///
    /// `word` must be 0 or the word of a live object.
    #[must_use]
    pub unsafe fn from_word(word: usize) -> Option<Object> {
        NonNull::new(word as *mut ObjectHeader).map(|ptr| Object { ptr })
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("ptr", &self.ptr)
            .field("class", &self.class().name())
            .finish()
    }
}

/// The target of a message send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Receiver {
    /// The null receiver. Messages to it are no-ops.
    #[default]
    Nil,
    /// A tagged small object.
    Small(SmallObject),
    /// A heap instance or a class.
    Object(Object),
}

impl Receiver {
    /// Decodes a machine word: 0 is nil, a word with tag bits set is a
    /// small object, anything else is an object pointer.
    ///
    /// # Safety
    ///
    /// A word without tag bits must be 0 or point at a live object.
    #[inline]
    #[must_use]
    pub unsafe fn from_word(word: usize) -> Receiver {
        if let Some(small) = SmallObject::from_word(word) {
            return Receiver::Small(small);
        }
        // SAFETY: forwarded to the caller.
        match unsafe { Object::from_word(word) } {
            Some(object) => Receiver::Object(object),
            None => Receiver::Nil,
        }
    }

    /// The receiver as a machine word.
    #[inline]
    #[must_use]
    pub fn as_word(&self) -> usize {
        match self {
            Receiver::Nil => 0,
            Receiver::Small(small) => small.as_word(),
            Receiver::Object(object) => object.as_word(),
        }
    }

    /// Whether this is the nil receiver.
    #[inline]
    #[must_use]
    pub fn is_nil(&self) -> bool {
        matches!(self, Receiver::Nil)
    }

    /// The heap object, if this is one.
    #[must_use]
    pub fn as_object(&self) -> Option<Object> {
        match self {
            Receiver::Object(object) => Some(*object),
            _ => None,
        }
    }

    /// The small object, if this is one.
    #[must_use]
    pub fn as_small(&self) -> Option<SmallObject> {
        match self {
            Receiver::Small(small) => Some(*small),
            _ => None,
        }
    }
}

impl From<Object> for Receiver {
    fn from(object: Object) -> Self {
        Receiver::Object(object)
    }
}

impl From<SmallObject> for Receiver {
    fn from(small: SmallObject) -> Self {
        Receiver::Small(small)
    }
}

impl From<Class> for Receiver {
    fn from(class: Class) -> Self {
        Receiver::Object(class.as_object())
    }
}

impl From<Option<Object>> for Receiver {
    fn from(object: Option<Object>) -> Self {
        object.map_or(Receiver::Nil, Receiver::Object)
    }
}
