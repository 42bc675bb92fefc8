//! Classes and metaclasses.
//!
//! A [`Class`] is a `Copy` handle to a [`ClassInner`] record in the process
//! metadata arena. Records are never freed: ownership belongs to whoever
//! builds and publishes classes (a module loader), and the core only keeps
//! non-owning links between them (superclass, metaclass, cached methods).
//!
//! # Lifecycle
//!
//! 1. [`Class::create`] builds the class and its metaclass in the
//!    *in construction* state. Methods and ivars may be added.
//! 2. [`Class::finish`] lays out the ivars after the superclass's and fixes
//!    the instance size. Ivars can no longer be added.
//! 3. Methods may still be added or replaced on a finished class; dispatch
//!    picks the change up through version bumps.
//!
//! # Memory Layout
//!
//! `ClassInner` is `#[repr(C)]` and starts with an `isa` word, exactly like
//! an instance. A class is therefore an object whose class is its metaclass,
//! and class methods dispatch through the same engine as instance methods.
//! A metaclass inherits from its superclass's metaclass; the root metaclass
//! inherits from the root class and is its own `isa`.

use crate::error::{Error, Result};
use crate::runtime::abort::OrAbort;
use crate::runtime::cache::DispatchCache;
use crate::runtime::ivar::{self, HEADER_SIZE, Ivar, MAX_IVAR_ALIGNMENT};
use crate::runtime::method::{Imp, Method};
use crate::runtime::object::{Object, ObjectHeader};
use crate::runtime::selector::SelectorId;
use kernobjc_log::debug;
use kernobjc_mem::metadata_arena;
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::RwLock;
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering};

const FLAG_META: u8 = 1 << 0;
const FLAG_FINISHED: u8 = 1 << 1;

/// Construction state of a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassState {
    /// Methods and ivars may be added.
    InConstruction,
    /// Layout is fixed.
    Finished,
}

/// Class record stored in the metadata arena.
#[repr(C)]
pub(crate) struct ClassInner {
    /// The metaclass. Must stay the first field so that a class pointer is a
    /// valid object pointer.
    isa: AtomicPtr<ClassInner>,
    super_class: Option<NonNull<ClassInner>>,
    name: &'static str,
    flags: AtomicU8,
    /// Append-only; lookup takes the first match.
    methods: RwLock<Vec<Method>>,
    /// Own ivars in declaration order.
    ivars: RwLock<Vec<Ivar>>,
    instance_size: AtomicUsize,
    cache: DispatchCache,
}

/// Handle to a class or metaclass.
///
/// # Example
///
/// ```
/// use kernobjc::Class;
///
/// let root = Class::new_root("Object");
/// let child = Class::new("Child", root);
/// root.finish();
/// child.finish();
///
/// assert!(child.is_subclass_of(root));
/// assert!(child.metaclass().is_meta());
/// ```
#[derive(Clone, Copy)]
pub struct Class {
    inner: NonNull<ClassInner>,
}

// SAFETY: ClassInner lives in the metadata arena and is never moved or
// freed. Mutable state is behind RwLocks or atomics.
unsafe impl Send for Class {}
// SAFETY: see above.
unsafe impl Sync for Class {}

impl Class {
    /// Creates a root class (no superclass).
    #[must_use]
    pub fn new_root(name: &str) -> Class {
        Self::create(None, name)
    }

    /// Creates a subclass of `super_class`.
    ///
    /// Aborts if `name` already appears in the superclass chain.
    #[must_use]
    pub fn new(name: &str, super_class: Class) -> Class {
        Self::create(Some(super_class), name)
    }

    /// Creates a class and its metaclass. Aborts on an inheritance cycle.
    #[must_use]
    pub fn create(super_class: Option<Class>, name: &str) -> Class {
        Self::try_create(super_class, name).or_abort()
    }

    /// Creates a class and its metaclass in the in-construction state.
    ///
    /// The class is not published anywhere; see
    /// [`ClassTable::publish`](crate::runtime::registry::ClassTable::publish).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InheritanceCycle`] if a class named `name` is already
    /// in the superclass chain.
    pub fn try_create(super_class: Option<Class>, name: &str) -> Result<Class> {
        if let Some(super_class) = super_class {
            Self::check_inheritance_cycle(name, super_class)?;
        }

        let arena = metadata_arena();
        let name: &'static str = arena.alloc_str(name);

        let class = Class::from_ref(arena.alloc(ClassInner::new(
            name,
            super_class.map(|class| class.inner),
            0,
            0,
        )));

        // A root metaclass inherits from its own class.
        let meta_super = match super_class {
            Some(super_class) => super_class.metaclass(),
            None => class,
        };
        let meta = Class::from_ref(arena.alloc(ClassInner::new(
            name,
            Some(meta_super.inner),
            FLAG_META | FLAG_FINISHED,
            std::mem::size_of::<ClassInner>(),
        )));

        let root_meta = match super_class {
            Some(super_class) => super_class.metaclass().isa(),
            None => meta,
        };
        meta.inner().isa.store(root_meta.as_ptr(), Ordering::Release);
        class.inner().isa.store(meta.as_ptr(), Ordering::Release);

        debug!(
            "created class {name} (superclass {})",
            super_class.map_or("none", |class| class.name())
        );
        Ok(class)
    }

    /// Walks the superclass chain looking for `new_class_name`.
    fn check_inheritance_cycle(new_class_name: &str, super_class: Class) -> Result<()> {
        let mut current = Some(super_class);
        while let Some(class) = current {
            if class.name() == new_class_name {
                return Err(Error::InheritanceCycle {
                    class: new_class_name.to_string(),
                });
            }
            current = class.super_class();
        }
        Ok(())
    }

    fn from_ref(inner: &mut ClassInner) -> Class {
        Class {
            inner: NonNull::from(inner),
        }
    }

    /// # Safety
    ///
    /// `inner` must come from another `Class`.
    #[inline]
    pub(crate) unsafe fn from_inner(inner: NonNull<ClassInner>) -> Class {
        Class { inner }
    }

    #[inline]
    pub(crate) fn inner_ptr(&self) -> NonNull<ClassInner> {
        self.inner
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut ClassInner {
        self.inner.as_ptr()
    }

    #[inline]
    fn inner(&self) -> &ClassInner {
        // SAFETY: class records are arena allocated and never freed.
        unsafe { self.inner.as_ref() }
    }

    #[inline]
    pub(crate) fn cache(&self) -> &DispatchCache {
        &self.inner().cache
    }

    fn isa(&self) -> Class {
        let ptr = self.inner().isa.load(Ordering::Acquire);
        // SAFETY: isa is set during try_create, before the handle escapes,
        // to another arena-allocated class.
        Class {
            inner: unsafe { NonNull::new_unchecked(ptr) },
        }
    }

    /// The class name. A metaclass shares its class's name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.inner().name
    }

    /// The superclass, or `None` for a root class.
    #[inline]
    #[must_use]
    pub fn super_class(&self) -> Option<Class> {
        self.inner().super_class.map(|inner| Class { inner })
    }

    /// The metaclass (for a metaclass: the root metaclass).
    #[must_use]
    pub fn metaclass(&self) -> Class {
        self.isa()
    }

    /// Whether this is a metaclass.
    #[must_use]
    pub fn is_meta(&self) -> bool {
        self.inner().flags.load(Ordering::Acquire) & FLAG_META != 0
    }

    /// Construction state.
    #[must_use]
    pub fn state(&self) -> ClassState {
        if self.is_finished() {
            ClassState::Finished
        } else {
            ClassState::InConstruction
        }
    }

    /// Whether [`finish`](Self::finish) has run.
    #[inline]
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.inner().flags.load(Ordering::Acquire) & FLAG_FINISHED != 0
    }

    /// Whether this class is `other` or inherits from it.
    #[must_use]
    pub fn is_subclass_of(&self, other: Class) -> bool {
        let mut current = Some(*self);
        while let Some(class) = current {
            if class == other {
                return true;
            }
            current = class.super_class();
        }
        false
    }

    /// Lays out the ivars and marks the class finished.
    ///
    /// Superclass ivars come first, then own ivars in declaration order,
    /// each aligned to its declared alignment. A root class's ivars start
    /// after the `isa` word.
    ///
    /// # Errors
    ///
    /// - [`Error::ClassAlreadyFinished`] if called twice
    /// - [`Error::SuperclassNotFinished`] if the superclass is unfinished
    /// - [`Error::DuplicateIvar`] if an own ivar shares a name with another
    ///   ivar of this class or an ancestor
    ///
    /// # Panics
    ///
    /// Panics if the ivar lock is poisoned.
    pub fn try_finish(&self) -> Result<()> {
        let inner = self.inner();
        // Held throughout so add_ivar cannot interleave.
        let ivars = inner.ivars.write().unwrap();

        if self.is_finished() {
            return Err(Error::ClassAlreadyFinished {
                class: self.name().to_string(),
            });
        }

        let start = match self.super_class() {
            Some(super_class) if !super_class.is_finished() => {
                return Err(Error::SuperclassNotFinished {
                    class: self.name().to_string(),
                    superclass: super_class.name().to_string(),
                });
            }
            Some(super_class) => super_class.inner().instance_size.load(Ordering::Acquire),
            None => HEADER_SIZE,
        };

        for (index, ivar) in ivars.iter().enumerate() {
            let clash = ivars[..index].iter().any(|other| other.name() == ivar.name())
                || self
                    .super_class()
                    .is_some_and(|super_class| super_class.ivar(ivar.name()).is_some());
            if clash {
                return Err(Error::DuplicateIvar {
                    class: self.name().to_string(),
                    ivar: ivar.name().to_string(),
                });
            }
        }

        let size = ivar::layout_ivars(start, &ivars);
        inner.instance_size.store(size, Ordering::Release);
        inner.flags.fetch_or(FLAG_FINISHED, Ordering::AcqRel);

        debug!(
            "finished class {} ({} ivars, instance size {size})",
            self.name(),
            ivars.len()
        );
        Ok(())
    }

    /// Lays out the ivars and marks the class finished. Aborts on error.
    pub fn finish(&self) {
        self.try_finish().or_abort();
    }

    /// Instance size in bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClassNotFinished`] before [`finish`](Self::finish).
    pub fn try_instance_size(&self) -> Result<usize> {
        if !self.is_finished() {
            return Err(Error::ClassNotFinished {
                class: self.name().to_string(),
            });
        }
        Ok(self.inner().instance_size.load(Ordering::Acquire))
    }

    /// Instance size in bytes. Aborts if the class is unfinished.
    #[must_use]
    pub fn instance_size(&self) -> usize {
        self.try_instance_size().or_abort()
    }

    // ===== Methods =====

    /// Appends a method for `selector`.
    ///
    /// Duplicates are kept but never win: lookup returns the earliest
    /// method for a selector. If this is the class's first method for
    /// `selector` and it overrides an inherited one, the inherited method's
    /// version is bumped so subclasses that cached it re-resolve.
    ///
    /// # Panics
    ///
    /// Panics if the method lock is poisoned.
    pub fn add_method(&self, selector: SelectorId, imp: Imp) -> Method {
        let inner = self.inner();
        let mut methods = inner.methods.write().unwrap();
        let method = Method::new(selector, imp, Some(*self));

        let first_own = !methods.iter().any(|m| m.selector() == selector);
        methods.push(method);
        drop(methods);

        // The override must be visible before the inherited version moves;
        // dispatch relies on this order when it fills caches.
        if first_own {
            if let Some(inherited) = self
                .super_class()
                .and_then(|super_class| super_class.lookup_method(selector))
            {
                inherited.invalidate();
            }
            inner.cache.evict(selector);
        }
        method
    }

    /// Appends a class-side method (a method of the metaclass).
    pub fn add_class_method(&self, selector: SelectorId, imp: Imp) -> Method {
        self.metaclass().add_method(selector, imp)
    }

    /// Swaps the implementation of this class's own method for `selector`
    /// and returns the old one. If the class has no own method for
    /// `selector`, behaves like [`add_method`](Self::add_method) and
    /// returns `None`.
    ///
    /// # Panics
    ///
    /// Panics if the method lock is poisoned.
    pub fn replace_method(&self, selector: SelectorId, imp: Imp) -> Option<Imp> {
        let existing = self.lookup_own_method(selector);
        match existing {
            Some(method) => Some(method.set_imp(imp)),
            None => {
                self.add_method(selector, imp);
                None
            }
        }
    }

    /// Finds the method for `selector` on this class only.
    ///
    /// # Panics
    ///
    /// Panics if the method lock is poisoned.
    #[must_use]
    pub fn lookup_own_method(&self, selector: SelectorId) -> Option<Method> {
        self.inner()
            .methods
            .read()
            .unwrap()
            .iter()
            .find(|method| method.selector() == selector)
            .copied()
    }

    /// Finds the method for `selector`, walking up the superclass chain.
    #[must_use]
    pub fn lookup_method(&self, selector: SelectorId) -> Option<Method> {
        let mut current = Some(*self);
        while let Some(class) = current {
            if let Some(method) = class.lookup_own_method(selector) {
                return Some(method);
            }
            current = class.super_class();
        }
        None
    }

    /// Whether instances of this class have a method for `selector`.
    #[must_use]
    pub fn responds_to(&self, selector: SelectorId) -> bool {
        self.lookup_method(selector).is_some()
    }

    /// This class's own methods in the order they were added.
    ///
    /// # Panics
    ///
    /// Panics if the method lock is poisoned.
    #[must_use]
    pub fn copy_method_list(&self) -> Vec<Method> {
        self.inner().methods.read().unwrap().clone()
    }

    /// Drops every entry from this class's dispatch cache.
    pub fn flush_cache(&self) {
        self.inner().cache.flush();
    }

    /// Number of live entries in this class's dispatch cache.
    #[must_use]
    pub fn cached_method_count(&self) -> usize {
        self.inner().cache.len()
    }

    // ===== Ivars =====

    /// Declares an ivar.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidAlignment`] unless `alignment` is a power of two no
    ///   larger than [`MAX_IVAR_ALIGNMENT`]
    /// - [`Error::InvalidIvarSize`] if `size` is zero
    /// - [`Error::IvarAfterFinish`] if the class is finished
    /// - [`Error::DuplicateIvar`] if the class or an ancestor already has an
    ///   ivar called `name`
    ///
    /// # Panics
    ///
    /// Panics if the ivar lock is poisoned.
    pub fn try_add_ivar(
        &self,
        name: &str,
        size: usize,
        alignment: usize,
        types: &str,
    ) -> Result<Ivar> {
        if !alignment.is_power_of_two() || alignment > MAX_IVAR_ALIGNMENT {
            return Err(Error::InvalidAlignment { alignment });
        }
        if size == 0 {
            return Err(Error::InvalidIvarSize {
                ivar: name.to_string(),
            });
        }

        let mut ivars = self.inner().ivars.write().unwrap();

        if self.is_finished() {
            return Err(Error::IvarAfterFinish {
                class: self.name().to_string(),
                ivar: name.to_string(),
            });
        }

        let inherited = self
            .super_class()
            .is_some_and(|super_class| super_class.ivar(name).is_some());
        if inherited || ivars.iter().any(|ivar| ivar.name() == name) {
            return Err(Error::DuplicateIvar {
                class: self.name().to_string(),
                ivar: name.to_string(),
            });
        }

        let ivar = Ivar::new(*self, name, size, alignment, types);
        ivars.push(ivar);
        Ok(ivar)
    }

    /// Declares an ivar. Aborts on error.
    pub fn add_ivar(&self, name: &str, size: usize, alignment: usize, types: &str) -> Ivar {
        self.try_add_ivar(name, size, alignment, types).or_abort()
    }

    /// Finds an ivar by name on this class or an ancestor.
    ///
    /// # Panics
    ///
    /// Panics if an ivar lock is poisoned.
    #[must_use]
    pub fn ivar(&self, name: &str) -> Option<Ivar> {
        let mut current = Some(*self);
        while let Some(class) = current {
            let found = class
                .inner()
                .ivars
                .read()
                .unwrap()
                .iter()
                .find(|ivar| ivar.name() == name)
                .copied();
            if found.is_some() {
                return found;
            }
            current = class.super_class();
        }
        None
    }

    /// This class's own ivars in declaration order.
    ///
    /// # Panics
    ///
    /// Panics if the ivar lock is poisoned.
    #[must_use]
    pub fn copy_ivar_list(&self) -> Vec<Ivar> {
        self.inner().ivars.read().unwrap().clone()
    }

    /// The class viewed as an object (whose class is the metaclass).
    #[must_use]
    pub fn as_object(&self) -> Object {
        // SAFETY: ClassInner is repr(C) and starts with the isa word, the
        // same layout as ObjectHeader.
        unsafe { Object::from_header(self.inner.cast::<ObjectHeader>()) }
    }
}

impl ClassInner {
    fn new(
        name: &'static str,
        super_class: Option<NonNull<ClassInner>>,
        flags: u8,
        instance_size: usize,
    ) -> Self {
        ClassInner {
            isa: AtomicPtr::new(ptr::null_mut()),
            super_class,
            name,
            flags: AtomicU8::new(flags),
            methods: RwLock::new(Vec::new()),
            ivars: RwLock::new(Vec::new()),
            instance_size: AtomicUsize::new(instance_size),
            cache: DispatchCache::new(),
        }
    }
}

impl PartialEq for Class {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self.inner.as_ptr(), other.inner.as_ptr())
    }
}

impl Eq for Class {}

impl std::hash::Hash for Class {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.hash(state);
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Class")
            .field("name", &self.name())
            .field("super_class", &self.super_class().map(|class| class.name()))
            .field("meta", &self.is_meta())
            .field("state", &self.state())
            .finish()
    }
}
