//! Selector interning.
//!
//! A selector is a message name plus its type signature, interned into a
//! small integer [`SelectorId`]. Ids are canonical: two ids are the same
//! selector exactly when the integers are equal, so comparing selectors never
//! touches strings.
//!
//! # Architecture
//!
//! Each [`SelectorTable`] keeps two structures:
//!
//! - a name -> id hash map (`hashbrown` with `FxHash`), used by registration
//! - a dense id -> entry index ([`SparseArray`]), used by [`name_of`] and
//!   [`types_of`]
//!
//! Names and type strings are copied into a page-limited [`MetadataArena`].
//! When that arena is full, registration fails with
//! [`Error::StringStorageExhausted`] and the caller decides what to do.
//!
//! # Thread Safety
//!
//! Registration takes the map's write lock for the whole
//! check-assign-publish sequence, so two threads can never race to the same
//! id. Entries are immutable once published, so reading the name or types of
//! an id already in hand is lock-free.
//!
//! [`name_of`]: SelectorTable::name_of
//! [`types_of`]: SelectorTable::types_of

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::runtime::abort::OrAbort;
use crate::runtime::sparse::SparseArray;
use fxhash::FxBuildHasher;
use hashbrown::HashMap;
use kernobjc_log::trace;
use kernobjc_mem::{ArenaAllocError, MetadataArena};
use std::borrow::Borrow;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ptr::NonNull;
use std::sync::RwLock;
use std::sync::atomic::{AtomicPtr, Ordering};

/// Interned selector identifier. `0` is the null selector.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SelectorId(u16);

impl SelectorId {
    /// The null selector. Never returned by registration.
    pub const NULL: SelectorId = SelectorId(0);

    /// Returns `true` for the null selector.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// The raw id.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Reinterprets a raw id. The id is only meaningful to the table that
    /// issued it.
    #[inline]
    #[must_use]
    pub const fn from_raw(id: u16) -> SelectorId {
        SelectorId(id)
    }

    /// Selector equality. Ids are canonical, so this is integer equality.
    #[inline]
    #[must_use]
    pub const fn equal(a: SelectorId, b: SelectorId) -> bool {
        a.0 == b.0
    }
}

impl fmt::Debug for SelectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SelectorId({})", self.0)
    }
}

impl fmt::Display for SelectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A string living in the table's arena.
#[derive(Clone, Copy)]
struct ArenaStr(NonNull<str>);

impl ArenaStr {
    #[inline]
    fn as_str(&self) -> &str {
        // SAFETY: points into the owning table's arena, which outlives every
        // ArenaStr stored in that table.
        unsafe { self.0.as_ref() }
    }
}

impl PartialEq for ArenaStr {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for ArenaStr {}

impl Hash for ArenaStr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_str().hash(state);
    }
}

impl Borrow<str> for ArenaStr {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

// SAFETY: ArenaStr is an immutable view into arena memory.
unsafe impl Send for ArenaStr {}
// SAFETY: see above.
unsafe impl Sync for ArenaStr {}

struct SelectorEntry {
    name: ArenaStr,
    types: ArenaStr,
}

struct Names {
    map: HashMap<ArenaStr, SelectorId, FxBuildHasher>,
    next_id: u32,
}

/// Registry of the selectors of one runtime.
pub struct SelectorTable {
    // Field order matters: everything pointing into `strings` drops first.
    names: RwLock<Names>,
    index: SparseArray<AtomicPtr<SelectorEntry>>,
    strings: MetadataArena,
    max_selectors: u16,
}

impl SelectorTable {
    /// Creates an empty table with the limits in `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the first string page cannot be
    /// allocated.
    pub fn new(config: &RuntimeConfig) -> Result<Self> {
        let strings =
            MetadataArena::with_limit(config.selector_page_size, config.max_selector_pages)
                .map_err(|_| Error::OutOfMemory)?;

        Ok(SelectorTable {
            names: RwLock::new(Names {
                map: HashMap::with_capacity_and_hasher(256, FxBuildHasher::default()),
                next_id: 1,
            }),
            index: SparseArray::new(),
            strings,
            max_selectors: config.max_selectors,
        })
    }

    /// Interns `(name, types)` and returns its id.
    ///
    /// Registering the same pair again returns the same id.
    ///
    /// # Errors
    ///
    /// - [`Error::SelectorTypeConflict`] if `name` is already registered with
    ///   different types
    /// - [`Error::SelectorTableExhausted`] if no ids are left
    /// - [`Error::StringStorageExhausted`] if the strings do not fit
    ///
    /// # Panics
    ///
    /// Panics if the table lock is poisoned.
    pub fn try_register(&self, name: &str, types: &str) -> Result<SelectorId> {
        {
            let names = self.names.read().unwrap();
            if let Some(&id) = names.map.get(name) {
                return self.check_types(id, name, types);
            }
        }

        let mut names = self.names.write().unwrap();

        // Another thread may have registered it while we waited.
        if let Some(&id) = names.map.get(name) {
            return self.check_types(id, name, types);
        }

        if names.next_id > u32::from(self.max_selectors) {
            return Err(Error::SelectorTableExhausted {
                max: self.max_selectors,
            });
        }

        let exhausted = |_: ArenaAllocError| Error::StringStorageExhausted {
            name: name.to_string(),
        };
        let name_copy = self.strings.try_alloc_str(name).map_err(exhausted)?;
        let types_copy = self.strings.try_alloc_str(types).map_err(exhausted)?;
        let entry = self
            .strings
            .try_alloc(SelectorEntry {
                name: ArenaStr(NonNull::from(name_copy)),
                types: ArenaStr(NonNull::from(types_copy)),
            })
            .map_err(exhausted)?;

        let raw = names.next_id as u16;
        let id = SelectorId(raw);
        names.next_id += 1;

        self.index
            .slot_or_insert(raw)
            .store(entry as *mut SelectorEntry, Ordering::Release);
        names.map.insert(ArenaStr(NonNull::from(name_copy)), id);

        trace!("registered selector {name} ({types}) as {id}");
        Ok(id)
    }

    /// Interns `(name, types)`, aborting on a type conflict.
    ///
    /// Exhaustion is still returned to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SelectorTableExhausted`] or
    /// [`Error::StringStorageExhausted`].
    pub fn register(&self, name: &str, types: &str) -> Result<SelectorId> {
        match self.try_register(name, types) {
            Err(err @ Error::SelectorTypeConflict { .. }) => crate::runtime::abort::fatal(err),
            other => other,
        }
    }

    fn check_types(&self, id: SelectorId, name: &str, types: &str) -> Result<SelectorId> {
        let entry = self.entry(id).or_abort();
        let registered = entry.types.as_str();
        if registered == types {
            Ok(id)
        } else {
            Err(Error::SelectorTypeConflict {
                name: name.to_string(),
                registered: registered.to_string(),
                requested: types.to_string(),
            })
        }
    }

    #[inline]
    fn entry(&self, id: SelectorId) -> Result<&SelectorEntry> {
        let slot = self
            .index
            .slot(id.0)
            .ok_or(Error::UnknownSelector { id: id.0 })?;
        let ptr = slot.load(Ordering::Acquire);
        if ptr.is_null() {
            return Err(Error::UnknownSelector { id: id.0 });
        }
        // SAFETY: entries live in self.strings and are never mutated.
        Ok(unsafe { &*ptr })
    }

    /// Returns the id of `name` without registering it.
    ///
    /// # Panics
    ///
    /// Panics if the table lock is poisoned.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<SelectorId> {
        self.names.read().unwrap().map.get(name).copied()
    }

    /// Name of a registered selector.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownSelector`] for an id this table never issued.
    pub fn try_name_of(&self, id: SelectorId) -> Result<&str> {
        self.entry(id).map(|entry| entry.name.as_str())
    }

    /// Type signature of a registered selector.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownSelector`] for an id this table never issued.
    pub fn try_types_of(&self, id: SelectorId) -> Result<&str> {
        self.entry(id).map(|entry| entry.types.as_str())
    }

    /// Name of a registered selector. Aborts on an unknown id.
    #[must_use]
    pub fn name_of(&self, id: SelectorId) -> &str {
        self.try_name_of(id).or_abort()
    }

    /// Type signature of a registered selector. Aborts on an unknown id.
    #[must_use]
    pub fn types_of(&self, id: SelectorId) -> &str {
        self.try_types_of(id).or_abort()
    }

    /// Whether `id` was issued by this table.
    #[must_use]
    pub fn contains(&self, id: SelectorId) -> bool {
        self.entry(id).is_ok()
    }

    /// Number of registered selectors.
    ///
    /// # Panics
    ///
    /// Panics if the table lock is poisoned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.read().unwrap().map.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Name for diagnostics: the selector name, or the raw id if unknown.
    pub(crate) fn describe(&self, id: SelectorId) -> String {
        match self.try_name_of(id) {
            Ok(name) => name.to_string(),
            Err(_) => id.to_string(),
        }
    }

    /// Bytes of string storage in use.
    #[must_use]
    pub fn storage_used(&self) -> usize {
        self.strings.stats().total_allocated
    }
}

impl fmt::Debug for SelectorTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectorTable")
            .field("len", &self.len())
            .field("max_selectors", &self.max_selectors)
            .finish()
    }
}

#[cfg(target_pointer_width = "64")]
mod signatures {
    pub(super) const VOID_NO_ARGS: &str = "v16@0:8";
    pub(super) const OBJECT_NO_ARGS: &str = "@16@0:8";
    pub(super) const METHOD_FOR_SELECTOR: &str = "^v24@0:8:16";
    pub(super) const BOOL_FOR_SELECTOR: &str = "C24@0:8:16";
}

#[cfg(not(target_pointer_width = "64"))]
mod signatures {
    pub(super) const VOID_NO_ARGS: &str = "v8@0:4";
    pub(super) const OBJECT_NO_ARGS: &str = "@8@0:4";
    pub(super) const METHOD_FOR_SELECTOR: &str = "^v12@0:4:8";
    pub(super) const BOOL_FOR_SELECTOR: &str = "C12@0:4:8";
}

/// Selectors every runtime registers at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WellKnownSelectors {
    /// `retain`
    pub retain: SelectorId,
    /// `release`
    pub release: SelectorId,
    /// `autorelease`
    pub autorelease: SelectorId,
    /// `dealloc`
    pub dealloc: SelectorId,
    /// `copy`
    pub copy: SelectorId,
    /// `load`
    pub load: SelectorId,
    /// `initialize`
    pub initialize: SelectorId,
    /// `.cxx_construct`
    pub cxx_construct: SelectorId,
    /// `.cxx_destruct`
    pub cxx_destruct: SelectorId,
    /// `_ARCCompliantRetainRelease`
    pub arc_compliant: SelectorId,
    /// `forwardedMethodForSelector:`, stage-one forwarding. The imp receives
    /// the missing selector id in `args[0]` and returns a method word or 0.
    pub forwarded_method: SelectorId,
    /// `dropsUnrecognizedForSelector:`. The imp receives the missing selector
    /// id in `args[0]`; a nonzero result drops the message.
    pub drops_unrecognized: SelectorId,
}

impl WellKnownSelectors {
    /// Name of the stage-one forwarding selector.
    pub const FORWARDED_METHOD: &'static str = "forwardedMethodForSelector:";
    /// Name of the silent-drop selector.
    pub const DROPS_UNRECOGNIZED: &'static str = "dropsUnrecognizedForSelector:";

    pub(crate) fn register(table: &SelectorTable) -> Result<Self> {
        use signatures::*;
        Ok(WellKnownSelectors {
            retain: table.try_register("retain", OBJECT_NO_ARGS)?,
            release: table.try_register("release", VOID_NO_ARGS)?,
            autorelease: table.try_register("autorelease", OBJECT_NO_ARGS)?,
            dealloc: table.try_register("dealloc", VOID_NO_ARGS)?,
            copy: table.try_register("copy", OBJECT_NO_ARGS)?,
            load: table.try_register("load", VOID_NO_ARGS)?,
            initialize: table.try_register("initialize", VOID_NO_ARGS)?,
            cxx_construct: table.try_register(".cxx_construct", VOID_NO_ARGS)?,
            cxx_destruct: table.try_register(".cxx_destruct", VOID_NO_ARGS)?,
            arc_compliant: table.try_register("_ARCCompliantRetainRelease", VOID_NO_ARGS)?,
            forwarded_method: table.try_register(Self::FORWARDED_METHOD, METHOD_FOR_SELECTOR)?,
            drops_unrecognized: table
                .try_register(Self::DROPS_UNRECOGNIZED, BOOL_FOR_SELECTOR)?,
        })
    }

    /// Whether `selector` belongs to the forwarding protocol itself.
    #[inline]
    #[must_use]
    pub fn is_forwarding(&self, selector: SelectorId) -> bool {
        selector == self.forwarded_method || selector == self.drops_unrecognized
    }
}
