//! Method records.
//!
//! A [`Method`] is a handle to a record in the metadata arena. Records are
//! never freed and never removed from their class; replacing an
//! implementation swaps the imp in place and bumps the version, which is what
//! dispatch caches compare against.

use crate::runtime::class::{Class, ClassInner};
use crate::runtime::object::Receiver;
use crate::runtime::selector::SelectorId;
use kernobjc_mem::metadata_arena;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

/// A method implementation.
///
/// `receiver` is the object the message was sent to, `cmd` the selector
/// that was sent, and `args` the message arguments as machine words. The
/// return value is a machine word; methods without a result return 0.
pub type Imp = fn(receiver: Receiver, cmd: SelectorId, args: &[usize]) -> usize;

pub(crate) struct MethodInner {
    selector: SelectorId,
    imp: AtomicPtr<()>,
    version: AtomicU32,
    owner: Option<NonNull<ClassInner>>,
}

/// Handle to a method record.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Method {
    inner: NonNull<MethodInner>,
}

// SAFETY: method records live in the metadata arena forever; the mutable
// parts (imp and version) are atomics.
unsafe impl Send for Method {}
// SAFETY: see above.
unsafe impl Sync for Method {}

#[inline]
fn imp_to_ptr(imp: Imp) -> *mut () {
    imp as *mut ()
}

#[inline]
fn ptr_to_imp(ptr: *mut ()) -> Imp {
    // SAFETY: every pointer stored in a MethodInner came from imp_to_ptr.
    unsafe { std::mem::transmute::<*mut (), Imp>(ptr) }
}

impl Method {
    pub(crate) fn new(selector: SelectorId, imp: Imp, owner: Option<Class>) -> Method {
        let inner = metadata_arena().alloc(MethodInner {
            selector,
            imp: AtomicPtr::new(imp_to_ptr(imp)),
            version: AtomicU32::new(0),
            owner: owner.map(|class| class.inner_ptr()),
        });
        Method {
            inner: NonNull::from(inner),
        }
    }

    /// Creates a method that belongs to no class.
    ///
    /// Forwarding resolvers use this to hand back a substitute
    /// implementation. Like every method record it is never freed, so
    /// resolvers should create their substitutes once and reuse them.
    #[must_use]
    pub fn new_detached(selector: SelectorId, imp: Imp) -> Method {
        Method::new(selector, imp, None)
    }

    #[inline]
    fn inner(&self) -> &MethodInner {
        // SAFETY: method records are arena allocated and never freed.
        unsafe { self.inner.as_ref() }
    }

    /// The selector this method answers.
    #[inline]
    #[must_use]
    pub fn selector(&self) -> SelectorId {
        self.inner().selector
    }

    /// The current implementation.
    #[inline]
    #[must_use]
    pub fn imp(&self) -> Imp {
        ptr_to_imp(self.inner().imp.load(Ordering::Acquire))
    }

    /// The current version. Bumped on every implementation change.
    #[inline]
    #[must_use]
    pub fn version(&self) -> u32 {
        self.inner().version.load(Ordering::Acquire)
    }

    /// The class whose method list holds this record.
    #[must_use]
    pub fn owner(&self) -> Option<Class> {
        // SAFETY: owners are arena-allocated classes.
        self.inner()
            .owner
            .map(|inner| unsafe { Class::from_inner(inner) })
    }

    /// Swaps in `imp`, bumps the version and returns the old imp.
    pub(crate) fn set_imp(&self, imp: Imp) -> Imp {
        let old = self.inner().imp.swap(imp_to_ptr(imp), Ordering::AcqRel);
        self.invalidate();
        ptr_to_imp(old)
    }

    /// Bumps the version so that cached copies of this method miss.
    pub(crate) fn invalidate(&self) {
        self.inner().version.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn as_ptr(&self) -> *mut MethodInner {
        self.inner.as_ptr()
    }

    /// # Safety
    ///
    /// `ptr` must be null or come from [`Method::as_ptr`].
    pub(crate) unsafe fn from_ptr(ptr: *mut MethodInner) -> Option<Method> {
        NonNull::new(ptr).map(|inner| Method { inner })
    }

    /// The method as a machine word, for returning it from an [`Imp`].
    #[inline]
    #[must_use]
    pub fn as_word(&self) -> usize {
        self.inner.as_ptr().addr()
    }

    /// Rebuilds a method from [`as_word`](Self::as_word). 0 yields `None`.
    ///
    /// # Safety
    ///
    /// `word` must be 0 or a value returned by `as_word`.
    #[must_use]
    pub unsafe fn from_word(word: usize) -> Option<Method> {
        NonNull::new(word as *mut MethodInner).map(|inner| Method { inner })
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("selector", &self.selector())
            .field("owner", &self.owner().map(|class| class.name()))
            .field("version", &self.version())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first(_: Receiver, _: SelectorId, _: &[usize]) -> usize {
        1
    }

    fn second(_: Receiver, _: SelectorId, _: &[usize]) -> usize {
        2
    }

    #[test]
    fn test_set_imp_bumps_version() {
        let method = Method::new_detached(SelectorId::from_raw(3), first);
        assert_eq!(method.version(), 0);
        assert_eq!((method.imp())(Receiver::Nil, SelectorId::NULL, &[]), 1);

        let old = method.set_imp(second);
        assert_eq!(old(Receiver::Nil, SelectorId::NULL, &[]), 1);
        assert_eq!((method.imp())(Receiver::Nil, SelectorId::NULL, &[]), 2);
        assert_eq!(method.version(), 1);
        assert!(method.owner().is_none());
    }

    #[test]
    fn test_word_round_trip() {
        let method = Method::new_detached(SelectorId::from_raw(4), first);
        let word = method.as_word();
        assert_ne!(word, 0);
        assert_eq!(unsafe { Method::from_word(word) }, Some(method));
        assert_eq!(unsafe { Method::from_word(0) }, None);
    }
}
