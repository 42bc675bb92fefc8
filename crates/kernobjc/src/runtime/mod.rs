//! `kernobjc` runtime module.
//!
//! This module provides the object runtime proper:
//!
//! - [`selector`]: selector interning
//! - [`tagged`]: small objects encoded in a machine word
//! - [`class`], [`ivar`], [`method`]: the class model
//! - [`object`]: heap instances and the [`Receiver`] sum type
//! - [`dispatch`], [`forwarding`]: message sending
//! - [`registry`]: published classes and module-unload support
//! - [`abort`]: the fatal error path
//!
//! # Runtime Instances
//!
//! Per-runtime state (selectors, the small-object table, the class table and
//! the hooks) lives in a [`Runtime`] value with an explicit
//! [`new`](Runtime::new)/[`teardown`](Runtime::teardown) lifecycle, so
//! independent runtimes can coexist, for example one per test.
//!
//! Classes, metaclasses, methods and ivars are allocated in the process-wide
//! metadata arena and are never freed. Ownership of a class belongs to
//! whoever builds and publishes it; the core only holds non-owning links.
//!
//! Classes are not tied to a runtime, but their method lists and dispatch
//! caches are keyed by [`SelectorId`], and ids are only meaningful to the
//! runtime that issued them. A class must only be messaged through the
//! runtime whose selectors it was built with; sharing one across runtimes
//! makes unrelated selectors collide.
//!
//! # Example
//!
//! ```rust
//! use kernobjc::{Class, Object, Receiver, Runtime, RuntimeConfig, SelectorId};
//!
//! fn magnitude(receiver: Receiver, _: SelectorId, _: &[usize]) -> usize {
//!     let object = receiver.as_object().unwrap();
//!     let x: i32 = unsafe { object.get_ivar_named("x") }.unwrap();
//!     let y: i32 = unsafe { object.get_ivar_named("y") }.unwrap();
//!     (x + y) as usize
//! }
//!
//! let rt = Runtime::new(RuntimeConfig::default()).unwrap();
//! let point = Class::new_root("Point");
//! point.add_ivar("x", 4, 4, "i");
//! point.add_ivar("y", 4, 4, "i");
//! let method = rt.add_method(point, "magnitude", "i16@0:8", magnitude).unwrap();
//! point.finish();
//!
//! let p = Object::allocate(point);
//! unsafe {
//!     p.set_ivar_named("x", 3i32);
//!     p.set_ivar_named("y", 4i32);
//! }
//! assert_eq!(rt.send(p.into(), method.selector(), &[]), 7);
//! ```

pub mod abort;
pub(crate) mod cache;
pub mod class;
pub mod dispatch;
pub mod forwarding;
pub mod ivar;
pub mod method;
pub mod object;
pub mod registry;
pub mod selector;
pub(crate) mod sparse;
pub mod tagged;

pub use abort::{AbortHandler, abort_process, clear_abort_handler, fatal, set_abort_handler};
pub use class::{Class, ClassState};
pub use dispatch::{Dispatch, DispatchState, Resolution, Super};
pub use forwarding::{ForwardingResolver, MAX_FORWARDING_DEPTH};
pub use ivar::Ivar;
pub use method::{Imp, Method};
pub use object::{Object, Receiver};
pub use registry::{ClassProvider, ClassTable, UnloadedImpPatch};
pub use selector::{SelectorId, SelectorTable, WellKnownSelectors};
pub use tagged::{SmallObject, SmallObjectTable};

use crate::config::RuntimeConfig;
use crate::error::Result;
use kernobjc_log::{info, set_level};
use std::fmt;
use std::sync::RwLock;

/// One instance of the object runtime.
pub struct Runtime {
    config: RuntimeConfig,
    pub(crate) selectors: SelectorTable,
    pub(crate) small_objects: SmallObjectTable,
    pub(crate) classes: ClassTable,
    pub(crate) well_known: WellKnownSelectors,
    forwarding_resolver: RwLock<Option<ForwardingResolver>>,
}

impl Runtime {
    /// Initializes a runtime.
    ///
    /// Validates `config`, applies its log level, and registers the
    /// well-known selectors.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or the selector table
    /// cannot hold the well-known selectors.
    pub fn new(config: RuntimeConfig) -> Result<Runtime> {
        config.validate()?;
        if let Some(level) = config.log_level {
            set_level(level);
        }

        let selectors = SelectorTable::new(&config)?;
        let well_known = WellKnownSelectors::register(&selectors)?;

        info!(
            "runtime initialized ({} selectors, {} small object slots)",
            selectors.len(),
            tagged::SMALL_OBJECT_CLASS_COUNT
        );

        Ok(Runtime {
            config,
            selectors,
            small_objects: SmallObjectTable::new(),
            classes: ClassTable::new(),
            well_known,
            forwarding_resolver: RwLock::new(None),
        })
    }

    /// Shuts the runtime down and releases its selector storage.
    ///
    /// Classes built while it was alive stay valid, but selector ids it
    /// issued mean nothing to other runtimes: their method lists and caches
    /// are keyed by those ids, so they must not be handed to another
    /// runtime afterwards.
    pub fn teardown(self) {
        info!("runtime torn down ({} selectors)", self.selectors.len());
    }

    /// The configuration the runtime was created with.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The selector table.
    #[must_use]
    pub fn selectors(&self) -> &SelectorTable {
        &self.selectors
    }

    /// The small-object class table.
    #[must_use]
    pub fn small_objects(&self) -> &SmallObjectTable {
        &self.small_objects
    }

    /// The published-class table.
    #[must_use]
    pub fn classes(&self) -> &ClassTable {
        &self.classes
    }

    /// The selectors registered at startup.
    #[must_use]
    pub fn well_known(&self) -> &WellKnownSelectors {
        &self.well_known
    }

    /// Interns a selector. Aborts on a type conflict.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SelectorTableExhausted`] or
    /// [`Error::StringStorageExhausted`] when storage runs out.
    ///
    /// [`Error::SelectorTableExhausted`]: crate::Error::SelectorTableExhausted
    /// [`Error::StringStorageExhausted`]: crate::Error::StringStorageExhausted
    pub fn register_selector(&self, name: &str, types: &str) -> Result<SelectorId> {
        self.selectors.register(name, types)
    }

    /// Interns `name` and appends a method for it to `class`.
    ///
    /// # Errors
    ///
    /// Same as [`register_selector`](Self::register_selector).
    pub fn add_method(&self, class: Class, name: &str, types: &str, imp: Imp) -> Result<Method> {
        let selector = self.register_selector(name, types)?;
        Ok(class.add_method(selector, imp))
    }

    /// Interns `name` and appends a class-side method for it to `class`.
    ///
    /// # Errors
    ///
    /// Same as [`register_selector`](Self::register_selector).
    pub fn add_class_method(
        &self,
        class: Class,
        name: &str,
        types: &str,
        imp: Imp,
    ) -> Result<Method> {
        let selector = self.register_selector(name, types)?;
        Ok(class.add_class_method(selector, imp))
    }

    /// Claims the small-object tag `mask` for `class`.
    ///
    /// Returns `false` if the mask is invalid or already claimed.
    pub fn register_small_class(&self, class: Class, mask: usize) -> bool {
        self.small_objects.register(class, mask)
    }

    /// Creates an instance of `class`: the small object with value 0 for a
    /// small-object class, a zeroed heap instance otherwise.
    ///
    /// # Errors
    ///
    /// Same as [`Object::try_allocate`].
    pub fn create_instance(&self, class: Class) -> Result<Receiver> {
        if let Some(small) = self.small_objects.encode(class, 0) {
            return Ok(Receiver::Small(small));
        }
        Object::try_allocate(class, 0).map(Receiver::Object)
    }

    /// The class of `receiver`, or `None` for nil and unregistered tags.
    #[must_use]
    pub fn class_of(&self, receiver: Receiver) -> Option<Class> {
        match receiver {
            Receiver::Nil => None,
            Receiver::Small(small) => self.small_objects.class_for_tag(small.tag()),
            Receiver::Object(object) => Some(object.class()),
        }
    }

    /// Changes the class of a heap receiver and returns the previous class.
    ///
    /// Small objects cannot change class; for them this does nothing and
    /// returns their class. Nil yields `None`.
    pub fn set_class(&self, receiver: Receiver, class: Class) -> Option<Class> {
        match receiver {
            Receiver::Nil => None,
            Receiver::Small(_) => self.class_of(receiver),
            Receiver::Object(object) => Some(object.set_class(class)),
        }
    }

    /// Installs the runtime-wide stage-1 forwarding hook.
    ///
    /// # Panics
    ///
    /// Panics if the hook lock is poisoned.
    pub fn set_forwarding_resolver(&self, resolver: ForwardingResolver) {
        *self.forwarding_resolver.write().unwrap() = Some(resolver);
    }

    /// Removes the forwarding hook.
    ///
    /// # Panics
    ///
    /// Panics if the hook lock is poisoned.
    pub fn clear_forwarding_resolver(&self) {
        *self.forwarding_resolver.write().unwrap() = None;
    }

    /// The installed forwarding hook.
    ///
    /// # Panics
    ///
    /// Panics if the hook lock is poisoned.
    #[must_use]
    pub fn forwarding_resolver(&self) -> Option<ForwardingResolver> {
        *self.forwarding_resolver.read().unwrap()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("selectors", &self.selectors)
            .field("small_objects", &self.small_objects)
            .field("classes", &self.classes)
            .finish_non_exhaustive()
    }
}
