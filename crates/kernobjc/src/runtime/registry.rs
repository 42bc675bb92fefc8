//! Published classes and module-unload support.
//!
//! The core never publishes a class on its own. A [`ClassTable`] is the
//! interface an external module loader uses to make finished classes
//! findable by name, to ask whether a module can be unloaded, and to retarget
//! methods whose code lived in an unloaded module.
//!
//! The table holds non-owning handles: unpublishing a class does not free
//! it, and nothing in the core ever does.

use crate::error::{Error, Result};
use crate::runtime::abort::{OrAbort, fatal};
use crate::runtime::class::Class;
use crate::runtime::method::Imp;
use crate::runtime::object::Receiver;
use crate::runtime::selector::SelectorId;
use fxhash::FxBuildHasher;
use hashbrown::HashMap;
use kernobjc_log::{debug, warn};
use std::fmt;
use std::ops::Range;
use std::sync::RwLock;

/// Supplies a class on demand when a name lookup misses.
pub type ClassProvider = fn(name: &str) -> Option<Class>;

/// Maps an implementation inside an unloaded region to its replacement.
pub type UnloadedImpPatch = fn(imp: Imp) -> Imp;

/// Replacement installed when no [`UnloadedImpPatch`] is set.
///
/// Sends through a [`Runtime`](crate::runtime::Runtime) never reach it: they
/// spot the trap first and report the selector by name. Only a caller that
/// holds the imp directly lands here, with just the selector id to show.
fn unloaded_trap(_: Receiver, cmd: SelectorId, _: &[usize]) -> usize {
    fatal(Error::MethodInUnloadedRegion {
        selector: cmd.to_string(),
    })
}

/// Whether `imp` is the trap left behind by an unload without a patch hook.
#[inline]
pub(crate) fn is_unloaded_trap(imp: Imp) -> bool {
    std::ptr::fn_addr_eq(imp, unloaded_trap as Imp)
}

/// Name -> class table of published classes.
pub struct ClassTable {
    classes: RwLock<HashMap<&'static str, Class, FxBuildHasher>>,
    provider: RwLock<Option<ClassProvider>>,
    patch: RwLock<Option<UnloadedImpPatch>>,
}

impl ClassTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        ClassTable {
            classes: RwLock::new(HashMap::with_hasher(FxBuildHasher::default())),
            provider: RwLock::new(None),
            patch: RwLock::new(None),
        }
    }

    /// Makes `class` findable by name.
    ///
    /// # Errors
    ///
    /// - [`Error::ClassNotFinished`] if `class` is in construction
    /// - [`Error::ClassAlreadyExists`] if the name is taken
    ///
    /// # Panics
    ///
    /// Panics if the table lock is poisoned.
    pub fn publish(&self, class: Class) -> Result<()> {
        if !class.is_finished() {
            return Err(Error::ClassNotFinished {
                class: class.name().to_string(),
            });
        }

        let mut classes = self.classes.write().unwrap();
        if classes.contains_key(class.name()) {
            return Err(Error::ClassAlreadyExists {
                name: class.name().to_string(),
            });
        }
        classes.insert(class.name(), class);
        debug!("published class {}", class.name());
        Ok(())
    }

    /// Removes `class` from the table. Returns `false` if it was not
    /// published.
    ///
    /// # Panics
    ///
    /// Panics if the table lock is poisoned.
    pub fn unpublish(&self, class: Class) -> bool {
        let mut classes = self.classes.write().unwrap();
        match classes.get(class.name()) {
            Some(published) if *published == class => {
                classes.remove(class.name());
                debug!("unpublished class {}", class.name());
                true
            }
            _ => false,
        }
    }

    /// Finds a published class, asking the provider hook on a miss.
    ///
    /// A finished class supplied by the provider is published under `name`.
    ///
    /// # Panics
    ///
    /// Panics if a table lock is poisoned.
    #[must_use]
    pub fn class_for_name(&self, name: &str) -> Option<Class> {
        if let Some(class) = self.classes.read().unwrap().get(name) {
            return Some(*class);
        }

        let provider = (*self.provider.read().unwrap())?;
        let class = provider(name)?;
        if class.is_finished() && class.name() == name {
            match self.publish(class) {
                Ok(()) => {}
                // Lost a race with another publisher of the same name.
                Err(Error::ClassAlreadyExists { .. }) => return self.class_for_name(name),
                Err(err) => warn!("provider returned unpublishable class {name}: {err}"),
            }
        }
        Some(class)
    }

    /// Like [`class_for_name`](Self::class_for_name).
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClassNotFound`] if neither the table nor the
    /// provider knows `name`.
    pub fn try_required_class(&self, name: &str) -> Result<Class> {
        self.class_for_name(name).ok_or_else(|| Error::ClassNotFound {
            name: name.to_string(),
        })
    }

    /// Like [`class_for_name`](Self::class_for_name), aborting if the class
    /// cannot be found.
    #[must_use]
    pub fn required_class(&self, name: &str) -> Class {
        self.try_required_class(name).or_abort()
    }

    /// All published classes, in no particular order.
    ///
    /// # Panics
    ///
    /// Panics if the table lock is poisoned.
    #[must_use]
    pub fn classes(&self) -> Vec<Class> {
        self.classes.read().unwrap().values().copied().collect()
    }

    /// Number of published classes.
    ///
    /// # Panics
    ///
    /// Panics if the table lock is poisoned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.classes.read().unwrap().len()
    }

    /// Whether nothing is published.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Installs the hook consulted by [`class_for_name`](Self::class_for_name).
    ///
    /// # Panics
    ///
    /// Panics if the hook lock is poisoned.
    pub fn set_class_provider(&self, provider: ClassProvider) {
        *self.provider.write().unwrap() = Some(provider);
    }

    /// Removes the class provider hook.
    ///
    /// # Panics
    ///
    /// Panics if the hook lock is poisoned.
    pub fn clear_class_provider(&self) {
        *self.provider.write().unwrap() = None;
    }

    /// Installs the hook used by
    /// [`patch_unloaded_region`](Self::patch_unloaded_region).
    ///
    /// # Panics
    ///
    /// Panics if the hook lock is poisoned.
    pub fn set_unloaded_imp_patch(&self, patch: UnloadedImpPatch) {
        *self.patch.write().unwrap() = Some(patch);
    }

    /// Removes the unloaded-region hook; patching then installs a trap that
    /// aborts when called.
    ///
    /// # Panics
    ///
    /// Panics if the hook lock is poisoned.
    pub fn clear_unloaded_imp_patch(&self) {
        *self.patch.write().unwrap() = None;
    }

    /// Whether the classes of a module can go away.
    ///
    /// Returns `false` if a published class outside `module` inherits from a
    /// class inside it. Never aborts.
    #[must_use]
    pub fn can_unload(&self, module: &[Class]) -> bool {
        for class in self.classes() {
            if module.contains(&class) {
                continue;
            }
            let mut ancestor = class.super_class();
            while let Some(current) = ancestor {
                if module.contains(&current) {
                    warn!(
                        "cannot unload module: {} still inherits from {}",
                        class.name(),
                        current.name()
                    );
                    return false;
                }
                ancestor = current.super_class();
            }
        }
        true
    }

    /// Retargets every method of every published class and metaclass whose
    /// implementation address lies in `region`.
    ///
    /// Each such imp is replaced by the installed [`UnloadedImpPatch`], or by
    /// a trap that aborts with [`Error::MethodInUnloadedRegion`]. Versions
    /// are bumped so cached copies re-resolve. Returns the number of methods
    /// patched.
    ///
    /// # Panics
    ///
    /// Panics if the hook lock is poisoned.
    pub fn patch_unloaded_region(&self, region: Range<usize>) -> usize {
        let patch = *self.patch.read().unwrap();
        let mut patched = 0;

        for class in self.classes() {
            for owner in [class, class.metaclass()] {
                for method in owner.copy_method_list() {
                    let imp = method.imp();
                    if !region.contains(&(imp as usize)) {
                        continue;
                    }
                    let replacement = match patch {
                        Some(patch) => patch(imp),
                        None => unloaded_trap as Imp,
                    };
                    method.set_imp(replacement);
                    patched += 1;
                }
            }
        }

        if patched > 0 {
            debug!("patched {patched} methods in unloaded region {region:#x?}");
        }
        patched
    }
}

impl Default for ClassTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ClassTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassTable")
            .field("len", &self.len())
            .finish()
    }
}
