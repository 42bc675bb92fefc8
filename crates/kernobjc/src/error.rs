//! Error types for the `kernobjc` runtime.
//!
//! Most variants describe construction-time programmer errors. Entry points
//! that must not continue past them route the error to
//! [`abort::fatal`](crate::runtime::abort::fatal); their `try_*` twins return
//! it instead. Selector storage exhaustion is the one condition that is always
//! returned to the caller.

use std::fmt;

/// Errors that can occur in the `kernobjc` runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Every selector id up to the configured maximum is taken.
    SelectorTableExhausted {
        /// The configured maximum number of selectors.
        max: u16,
    },

    /// The selector name/type string storage is full.
    StringStorageExhausted {
        /// Name of the selector that could not be stored.
        name: String,
    },

    /// A selector name was registered again with a different signature.
    SelectorTypeConflict {
        /// The selector name.
        name: String,
        /// The signature it was first registered with.
        registered: String,
        /// The signature of the rejected registration.
        requested: String,
    },

    /// A selector id that the registry never handed out.
    UnknownSelector {
        /// The raw id.
        id: u16,
    },

    /// `finish` was called on a class that is already finished.
    ClassAlreadyFinished {
        /// Class name.
        class: String,
    },

    /// The operation requires a finished class.
    ClassNotFinished {
        /// Class name.
        class: String,
    },

    /// A class was finished before its superclass.
    SuperclassNotFinished {
        /// Class name.
        class: String,
        /// Superclass name.
        superclass: String,
    },

    /// An ivar was added to a finished class.
    IvarAfterFinish {
        /// Class name.
        class: String,
        /// Ivar name.
        ivar: String,
    },

    /// An ivar name is already used by the class or one of its ancestors.
    DuplicateIvar {
        /// Class name.
        class: String,
        /// Ivar name.
        ivar: String,
    },

    /// Invalid alignment specified.
    InvalidAlignment {
        /// The requested alignment.
        alignment: usize,
    },

    /// An ivar was declared with size zero.
    InvalidIvarSize {
        /// Ivar name.
        ivar: String,
    },

    /// Inheritance cycle detected.
    InheritanceCycle {
        /// Name of the class that would close the cycle.
        class: String,
    },

    /// The mask is zero or has bits outside the small-object tag bits.
    InvalidSmallObjectMask {
        /// The rejected mask.
        mask: usize,
    },

    /// Another class already owns this small-object tag.
    SmallObjectSlotTaken {
        /// The contested mask.
        mask: usize,
    },

    /// A class with this name is already published.
    ClassAlreadyExists {
        /// Class name.
        name: String,
    },

    /// No published class has this name.
    ClassNotFound {
        /// Class name.
        name: String,
    },

    /// Dispatch found no method and no forwarding resolution.
    UnrecognizedSelector {
        /// Receiver's class name.
        class: String,
        /// Selector name.
        selector: String,
    },

    /// A tagged receiver whose tag has no registered class.
    UnregisteredTag {
        /// The receiver word.
        word: usize,
    },

    /// A method whose code was unloaded was called.
    MethodInUnloadedRegion {
        /// Selector name.
        selector: String,
    },

    /// Instance allocation failed.
    OutOfMemory,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::SelectorTableExhausted { max } => {
                write!(f, "Selector table exhausted: all {max} selector ids are in use")
            }
            Error::StringStorageExhausted { name } => {
                write!(f, "Selector string storage exhausted while registering '{name}'")
            }
            Error::SelectorTypeConflict {
                name,
                registered,
                requested,
            } => write!(
                f,
                "Selector '{name}' registered with types '{registered}', \
                 cannot register it again with '{requested}'"
            ),
            Error::UnknownSelector { id } => {
                write!(f, "Selector id {id} was never registered")
            }
            Error::ClassAlreadyFinished { class } => {
                write!(f, "Class '{class}' is already finished")
            }
            Error::ClassNotFinished { class } => {
                write!(f, "Class '{class}' is not finished")
            }
            Error::SuperclassNotFinished { class, superclass } => write!(
                f,
                "Cannot finish class '{class}': superclass '{superclass}' is not finished"
            ),
            Error::IvarAfterFinish { class, ivar } => {
                write!(f, "Cannot add ivar '{ivar}' to finished class '{class}'")
            }
            Error::DuplicateIvar { class, ivar } => write!(
                f,
                "Ivar '{ivar}' already exists on class '{class}' or one of its ancestors"
            ),
            Error::InvalidAlignment { alignment } => {
                write!(f, "Invalid alignment: {alignment} (must be a power of two, at most 16)")
            }
            Error::InvalidIvarSize { ivar } => {
                write!(f, "Ivar '{ivar}' has size zero")
            }
            Error::InheritanceCycle { class } => {
                write!(f, "Inheritance cycle detected at class '{class}'")
            }
            Error::InvalidSmallObjectMask { mask } => {
                write!(f, "Invalid small object mask {mask:#x}")
            }
            Error::SmallObjectSlotTaken { mask } => {
                write!(f, "Small object mask {mask:#x} is already registered")
            }
            Error::ClassAlreadyExists { name } => {
                write!(f, "Class '{name}' is already published")
            }
            Error::ClassNotFound { name } => {
                write!(f, "Required class '{name}' not found")
            }
            Error::UnrecognizedSelector { class, selector } => {
                write!(f, "Class '{class}' does not respond to selector '{selector}'")
            }
            Error::UnregisteredTag { word } => {
                write!(f, "Tagged receiver {word:#x} has no registered small object class")
            }
            Error::MethodInUnloadedRegion { selector } => write!(
                f,
                "Method '{selector}' was called after its code was unloaded"
            ),
            Error::OutOfMemory => write!(f, "Out of memory"),
        }
    }
}

impl std::error::Error for Error {}

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;
