//! `kernobjc`: an Objective-C style object runtime small enough to embed in a
//! kernel.
//!
//! `kernobjc` implements the core of a dynamic object runtime:
//!
//! - **Selectors** interned into 16-bit ids, comparable by integer equality
//! - **Small objects**: integers tagged into the low bits of a receiver word,
//!   messaged without any memory access
//! - **Classes** with metaclasses, ivar layout and append-only method lists
//! - **Message dispatch** through per-class lock-free caches, a superclass
//!   chain search and a two-stage forwarding protocol
//!
//! Collections, strings, reference counting and module loading are left to
//! the layers above.
//!
//! # Architecture
//!
//! - **Runtime layer** ([`runtime`]): selector tables, classes, objects and
//!   dispatch
//! - **Memory layer** (`kernobjc-mem`): the metadata arena that class and
//!   selector records live in
//! - **Logging** (`kernobjc-log`): leveled logging with a pluggable sink
//!
//! # Example
//!
//! ```rust
//! use kernobjc::{Class, Object, Receiver, Runtime, RuntimeConfig, SelectorId};
//!
//! fn hello(_: Receiver, _: SelectorId, _: &[usize]) -> usize {
//!     1
//! }
//!
//! let rt = Runtime::new(RuntimeConfig::default()).unwrap();
//! let greeter = Class::new_root("Greeter");
//! let method = rt.add_method(greeter, "hello", "Q16@0:8", hello).unwrap();
//! greeter.finish();
//!
//! let object = Object::allocate(greeter);
//! assert_eq!(rt.send(object.into(), method.selector(), &[]), 1);
//! ```

pub mod config;
pub mod error;
pub mod runtime;

// Re-export commonly used types
pub use config::RuntimeConfig;
pub use error::{Error, Result};
pub use runtime::{
    Class, ClassState, ClassTable, Imp, Ivar, Method, Object, Receiver, Resolution, Runtime,
    SelectorId, SelectorTable, SmallObject, SmallObjectTable, Super, WellKnownSelectors,
};
