//! Message dispatch.
//!
//! Every send runs the same small state machine:
//!
//! ```text
//! Decode ──nil──────────────────────────────────────────────▶ Done(Nil)
//!   │ ──unregistered tag────────────────────────────────────▶ Done(UnregisteredTag)
//!   ▼
//! ProbeCache ──hit──────────────────────────────────────────▶ Done(Cached)
//!   │ miss
//!   ▼
//! ChainSearch ──found (fill the receiver class's cache)─────▶ Done(Found)
//!   │ not found
//!   ▼
//! Forward ──substitute / drop / nothing─────────────────────▶ Done(Forwarded | Dropped | Unrecognized)
//! ```
//!
//! [`Dispatch::transition`] computes one step from the current state alone;
//! [`Runtime::resolve`] runs it to completion. [`Runtime::send`] then calls
//! the resolved implementation, yields 0 for nil and dropped messages, and
//! aborts on anything unrecognized.
//!
//! Super sends skip the decode and cache states: the chain search starts at
//! the caller's static superclass and its result is never cached, since the
//! caches are keyed by the receiver's concrete class.

use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::runtime::abort::{OrAbort, fatal};
use crate::runtime::class::Class;
use crate::runtime::method::{Imp, Method};
use crate::runtime::object::Receiver;
use crate::runtime::registry::is_unloaded_trap;
use crate::runtime::selector::SelectorId;

/// Outcome of resolving a send, before anything is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The receiver is nil.
    Nil,
    /// Hit in the receiver class's cache.
    Cached(Method),
    /// Found by walking the class chain.
    Found(Method),
    /// Substitute supplied by forwarding stage 1. Never cached.
    Forwarded(Method),
    /// Forwarding stage 2 asked for the message to be dropped.
    Dropped,
    /// No method and no forwarding resolution.
    Unrecognized {
        /// The receiver's class.
        class: Class,
        /// The selector sent.
        selector: SelectorId,
    },
    /// A small object whose tag has no registered class.
    UnregisteredTag {
        /// The receiver word.
        word: usize,
    },
}

impl Resolution {
    /// The method that a send would invoke, if any.
    #[must_use]
    pub fn method(&self) -> Option<Method> {
        match self {
            Resolution::Cached(method)
            | Resolution::Found(method)
            | Resolution::Forwarded(method) => Some(*method),
            _ => None,
        }
    }

    /// Whether the send completes without invoking anything.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        matches!(self, Resolution::Nil | Resolution::Dropped)
    }
}

/// States of the dispatch state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    /// Work out the receiver's class.
    Decode,
    /// Probe `class`'s cache.
    ProbeCache {
        /// The receiver's class.
        class: Class,
    },
    /// Walk the chain from `start`. Found methods go into `receiver_class`'s
    /// cache when `fill_cache` is set.
    ChainSearch {
        /// Where the search starts.
        start: Class,
        /// The receiver's class.
        receiver_class: Class,
        /// Whether to cache the result.
        fill_cache: bool,
    },
    /// Run the forwarding stages.
    Forward {
        /// The receiver's class.
        receiver_class: Class,
    },
    /// Terminal.
    Done(Resolution),
}

/// One send in flight.
pub struct Dispatch<'rt> {
    runtime: &'rt Runtime,
    receiver: Receiver,
    selector: SelectorId,
}

impl<'rt> Dispatch<'rt> {
    /// Prepares to resolve `selector` sent to `receiver`.
    #[must_use]
    pub fn new(runtime: &'rt Runtime, receiver: Receiver, selector: SelectorId) -> Self {
        Dispatch {
            runtime,
            receiver,
            selector,
        }
    }

    /// Computes the state that follows `state`.
    #[must_use]
    pub fn transition(&self, state: DispatchState) -> DispatchState {
        match state {
            DispatchState::Decode => match self.receiver {
                Receiver::Nil => DispatchState::Done(Resolution::Nil),
                Receiver::Small(small) => {
                    match self.runtime.small_objects.class_for_tag(small.tag()) {
                        Some(class) => DispatchState::ProbeCache { class },
                        None => DispatchState::Done(Resolution::UnregisteredTag {
                            word: small.as_word(),
                        }),
                    }
                }
                Receiver::Object(object) => DispatchState::ProbeCache {
                    class: object.class(),
                },
            },
            DispatchState::ProbeCache { class } => match class.cache().probe(self.selector) {
                Some(method) => DispatchState::Done(Resolution::Cached(method)),
                None => DispatchState::ChainSearch {
                    start: class,
                    receiver_class: class,
                    fill_cache: true,
                },
            },
            DispatchState::ChainSearch {
                start,
                receiver_class,
                fill_cache,
            } => match start.lookup_method(self.selector) {
                Some(method) => {
                    if fill_cache {
                        // An override bumps the inherited version after
                        // publishing itself. Read the version, then confirm
                        // the lookup still holds before caching.
                        let version = method.version();
                        if start.lookup_method(self.selector) == Some(method) {
                            receiver_class
                                .cache()
                                .fill(self.selector, method, version);
                        }
                    }
                    DispatchState::Done(Resolution::Found(method))
                }
                None => DispatchState::Forward { receiver_class },
            },
            DispatchState::Forward { receiver_class } => DispatchState::Done(
                self.runtime
                    .forward(self.receiver, receiver_class, self.selector),
            ),
            done @ DispatchState::Done(_) => done,
        }
    }

    /// Runs the machine from `state` until it is done.
    #[must_use]
    pub fn run(&self, mut state: DispatchState) -> Resolution {
        loop {
            match self.transition(state) {
                DispatchState::Done(resolution) => return resolution,
                next => state = next,
            }
        }
    }
}

/// A super send: message `receiver`, but look methods up from `class`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Super {
    /// The object the message is for.
    pub receiver: Receiver,
    /// The static superclass the search starts at.
    pub class: Class,
}

impl Super {
    /// Creates a super context.
    #[must_use]
    pub fn new(receiver: impl Into<Receiver>, class: Class) -> Self {
        Super {
            receiver: receiver.into(),
            class,
        }
    }
}

fn nil_imp(_: Receiver, _: SelectorId, _: &[usize]) -> usize {
    0
}

impl Runtime {
    /// Resolves `selector` sent to `receiver` without invoking anything.
    #[must_use]
    pub fn resolve(&self, receiver: Receiver, selector: SelectorId) -> Resolution {
        Dispatch::new(self, receiver, selector).run(DispatchState::Decode)
    }

    /// Resolves a super send.
    #[must_use]
    pub fn resolve_super(&self, context: &Super, selector: SelectorId) -> Resolution {
        let dispatch = Dispatch::new(self, context.receiver, selector);
        let receiver_class = match dispatch.transition(DispatchState::Decode) {
            DispatchState::ProbeCache { class } => class,
            DispatchState::Done(resolution) => return resolution,
            _ => unreachable!("decode yields a class or a resolution"),
        };
        dispatch.run(DispatchState::ChainSearch {
            start: context.class,
            receiver_class,
            fill_cache: false,
        })
    }

    fn invoke(
        &self,
        resolution: Resolution,
        receiver: Receiver,
        selector: SelectorId,
        args: &[usize],
    ) -> Result<usize> {
        match resolution {
            Resolution::Nil | Resolution::Dropped => Ok(0),
            Resolution::Cached(method)
            | Resolution::Found(method)
            | Resolution::Forwarded(method) => {
                let imp = self.callable_imp(method)?;
                Ok(imp(receiver, selector, args))
            }
            unresolved => Err(self.unresolved_error(unresolved)),
        }
    }

    /// The method's imp, unless its code was unloaded without a patch.
    fn callable_imp(&self, method: Method) -> Result<Imp> {
        let imp = method.imp();
        if is_unloaded_trap(imp) {
            return Err(Error::MethodInUnloadedRegion {
                selector: self.selectors.describe(method.selector()),
            });
        }
        Ok(imp)
    }

    fn unresolved_error(&self, resolution: Resolution) -> Error {
        match resolution {
            Resolution::Unrecognized { class, selector } => Error::UnrecognizedSelector {
                class: class.name().to_string(),
                selector: self.selectors.describe(selector),
            },
            Resolution::UnregisteredTag { word } => Error::UnregisteredTag { word },
            _ => unreachable!("only unresolved outcomes are errors"),
        }
    }

    /// Sends `selector` to `receiver` with `args`.
    ///
    /// # Errors
    ///
    /// - [`Error::UnrecognizedSelector`] if neither the class chain nor
    ///   forwarding resolves the selector
    /// - [`Error::UnregisteredTag`] for a small object with an unknown tag
    /// - [`Error::MethodInUnloadedRegion`] if the method's code was unloaded
    ///   and no patch hook replaced it
    pub fn try_send(
        &self,
        receiver: Receiver,
        selector: SelectorId,
        args: &[usize],
    ) -> Result<usize> {
        let resolution = self.resolve(receiver, selector);
        self.invoke(resolution, receiver, selector, args)
    }

    /// Sends `selector` to `receiver` with `args` and returns the result
    /// word. Nil receivers and dropped messages yield 0. Aborts if the
    /// message is not understood.
    ///
    /// # Example
    ///
    /// ```
    /// use kernobjc::{Class, Object, Receiver, Runtime, RuntimeConfig, SelectorId};
    ///
    /// fn answer(_: Receiver, _: SelectorId, _: &[usize]) -> usize {
    ///     42
    /// }
    ///
    /// let rt = Runtime::new(RuntimeConfig::default()).unwrap();
    /// let class = Class::new_root("Answer");
    /// rt.add_method(class, "answer", "Q16@0:8", answer).unwrap();
    /// class.finish();
    ///
    /// let sel = rt.register_selector("answer", "Q16@0:8").unwrap();
    /// let object = Object::allocate(class);
    /// assert_eq!(rt.send(object.into(), sel, &[]), 42);
    /// assert_eq!(rt.send(Receiver::Nil, sel, &[]), 0);
    /// ```
    pub fn send(&self, receiver: Receiver, selector: SelectorId, args: &[usize]) -> usize {
        self.try_send(receiver, selector, args).or_abort()
    }

    /// Super send variant of [`try_send`](Self::try_send).
    ///
    /// # Errors
    ///
    /// Same as [`try_send`](Self::try_send).
    pub fn try_send_super(
        &self,
        context: &Super,
        selector: SelectorId,
        args: &[usize],
    ) -> Result<usize> {
        let resolution = self.resolve_super(context, selector);
        self.invoke(resolution, context.receiver, selector, args)
    }

    /// Sends `selector` to `context.receiver`, starting the method search at
    /// `context.class`. Aborts if the message is not understood.
    pub fn send_super(&self, context: &Super, selector: SelectorId, args: &[usize]) -> usize {
        self.try_send_super(context, selector, args).or_abort()
    }

    /// The implementation a send of `selector` to `receiver` would call.
    /// Nil receivers and dropped messages get an imp that returns 0.
    /// Aborts if the message is not understood or its code was unloaded.
    #[must_use]
    pub fn lookup_imp(&self, receiver: Receiver, selector: SelectorId) -> Imp {
        match self.resolve(receiver, selector) {
            Resolution::Nil | Resolution::Dropped => nil_imp,
            Resolution::Cached(method)
            | Resolution::Found(method)
            | Resolution::Forwarded(method) => self.callable_imp(method).or_abort(),
            unresolved => fatal(self.unresolved_error(unresolved)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::object::Object;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::default()).unwrap()
    }

    fn base_imp(_: Receiver, _: SelectorId, _: &[usize]) -> usize {
        1
    }

    fn derived_imp(_: Receiver, _: SelectorId, _: &[usize]) -> usize {
        2
    }

    fn sum_args(_: Receiver, _: SelectorId, args: &[usize]) -> usize {
        args.iter().sum()
    }

    #[test]
    fn test_transitions_step_by_step() {
        let rt = runtime();
        let class = Class::new_root("StepRoot");
        let sel = rt.register_selector("step", "v16@0:8").unwrap();
        let method = class.add_method(sel, base_imp);
        class.finish();
        let receiver = Receiver::from(Object::allocate(class));
        let dispatch = Dispatch::new(&rt, receiver, sel);

        let probe = dispatch.transition(DispatchState::Decode);
        assert_eq!(probe, DispatchState::ProbeCache { class });

        let search = dispatch.transition(probe);
        assert_eq!(
            search,
            DispatchState::ChainSearch {
                start: class,
                receiver_class: class,
                fill_cache: true
            }
        );

        assert_eq!(
            dispatch.transition(search),
            DispatchState::Done(Resolution::Found(method))
        );
        assert_eq!(
            dispatch.transition(probe),
            DispatchState::Done(Resolution::Cached(method))
        );
    }

    #[test]
    fn test_nil_receiver_is_noop() {
        let rt = runtime();
        let sel = rt.register_selector("anything", "v16@0:8").unwrap();
        assert_eq!(rt.resolve(Receiver::Nil, sel), Resolution::Nil);
        assert_eq!(rt.send(Receiver::Nil, sel, &[]), 0);
        assert_eq!((rt.lookup_imp(Receiver::Nil, sel))(Receiver::Nil, sel, &[]), 0);
    }

    #[test]
    fn test_found_on_ancestor_is_cached_on_receiver_class() {
        let rt = runtime();
        let root = Class::new_root("CacheRoot");
        let sel = rt.register_selector("inherited", "v16@0:8").unwrap();
        let method = root.add_method(sel, base_imp);
        root.finish();
        let child = Class::new("CacheChild", root);
        child.finish();
        let receiver = Receiver::from(Object::allocate(child));

        assert_eq!(rt.resolve(receiver, sel), Resolution::Found(method));
        assert_eq!(rt.resolve(receiver, sel), Resolution::Cached(method));
        assert_eq!(child.cached_method_count(), 1);
        assert_eq!(root.cached_method_count(), 0);
    }

    #[test]
    fn test_arguments_reach_the_imp() {
        let rt = runtime();
        let class = Class::new_root("ArgsRoot");
        let method = rt
            .add_method(class, "sum:with:", "Q32@0:8Q16Q24", sum_args)
            .unwrap();
        class.finish();
        let receiver = Receiver::from(Object::allocate(class));

        assert_eq!(rt.send(receiver, method.selector(), &[40, 2]), 42);
    }

    #[test]
    fn test_super_send_skips_override_and_cache() {
        let rt = runtime();
        let root = Class::new_root("SuperRoot");
        let sel = rt.register_selector("describe", "v16@0:8").unwrap();
        root.add_method(sel, base_imp);
        root.finish();
        let child = Class::new("SuperChild", root);
        child.add_method(sel, derived_imp);
        child.finish();
        let object = Object::allocate(child);

        assert_eq!(rt.send(object.into(), sel, &[]), 2);
        child.flush_cache();
        assert_eq!(rt.send_super(&Super::new(object, root), sel, &[]), 1);
        assert_eq!(child.cached_method_count(), 0);
    }

    #[test]
    fn test_unrecognized_selector_is_reported() {
        let rt = runtime();
        let class = Class::new_root("Deaf");
        class.finish();
        let sel = rt.register_selector("listen", "v16@0:8").unwrap();

        assert_eq!(
            rt.try_send(Object::allocate(class).into(), sel, &[]),
            Err(Error::UnrecognizedSelector {
                class: "Deaf".into(),
                selector: "listen".into()
            })
        );
    }

    #[test]
    #[should_panic(expected = "Class 'Mute' does not respond to selector 'speak'")]
    fn test_unrecognized_selector_aborts() {
        let rt = runtime();
        let class = Class::new_root("Mute");
        class.finish();
        let sel = rt.register_selector("speak", "v16@0:8").unwrap();
        rt.send(Object::allocate(class).into(), sel, &[]);
    }
}
