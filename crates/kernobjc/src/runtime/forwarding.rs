// Message forwarding
//
// Runs when a send finds no method on the receiver's class chain.
//
// Stage 1 asks for a substitute method: first the receiver's own class
// through `forwardedMethodForSelector:`, then the runtime-wide resolver hook.
// A substitute is invoked for this send only and never cached.
//
// Stage 2 asks the class whether it wants the message dropped, through
// `dropsUnrecognizedForSelector:`. A dropped message yields 0.
//
// If both stages come up empty the send is unrecognized, which is fatal for
// `send`. A failure of either forwarding selector is unrecognized at once, so
// forwarding never recurses into itself. Nested forwarding from inside a
// substitute is bounded by a per-thread depth counter.

use crate::runtime::Runtime;
use crate::runtime::class::Class;
use crate::runtime::dispatch::Resolution;
use crate::runtime::method::Method;
use crate::runtime::object::Receiver;
use crate::runtime::selector::SelectorId;
use kernobjc_log::{trace, warn};
use std::cell::Cell;

// ============================================================================
// Hook Types
// ============================================================================

/// Runtime-wide stage-1 forwarding hook.
///
/// Called with the receiver and the selector that failed. Returning a method
/// makes the send invoke it instead; returning `None` moves on to stage 2.
///
/// # Thread Safety
///
/// Resolvers may be called from any thread. They may send messages, but a
/// message that again needs forwarding counts towards the depth limit.
pub type ForwardingResolver = fn(receiver: Receiver, selector: SelectorId) -> Option<Method>;

// ============================================================================
// Forwarding Depth Tracking
// ============================================================================

/// Nested forwarding deeper than this is treated as unrecognized.
pub const MAX_FORWARDING_DEPTH: u32 = 32;

thread_local! {
    static FORWARDING_DEPTH: Cell<u32> = const { Cell::new(0) };
}

struct DepthGuard;

impl DepthGuard {
    fn enter() -> Option<DepthGuard> {
        FORWARDING_DEPTH.with(|depth| {
            let current = depth.get();
            if current >= MAX_FORWARDING_DEPTH {
                None
            } else {
                depth.set(current + 1);
                Some(DepthGuard)
            }
        })
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        FORWARDING_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

// ============================================================================
// Forwarding Resolution
// ============================================================================

impl Runtime {
    /// Runs both forwarding stages for `selector` sent to `receiver`, whose
    /// class is `class`.
    pub(crate) fn forward(
        &self,
        receiver: Receiver,
        class: Class,
        selector: SelectorId,
    ) -> Resolution {
        let unrecognized = Resolution::Unrecognized { class, selector };

        if selector.is_null() || self.well_known.is_forwarding(selector) {
            return unrecognized;
        }

        let Some(_guard) = DepthGuard::enter() else {
            warn!(
                "forwarding depth limit {MAX_FORWARDING_DEPTH} hit for {} on {}",
                self.selectors.describe(selector),
                class.name()
            );
            return unrecognized;
        };

        if let Some(method) = self.forwarded_method(receiver, class, selector) {
            trace!(
                "forwarded {} on {} to a substitute",
                self.selectors.describe(selector),
                class.name()
            );
            method.invalidate();
            return Resolution::Forwarded(method);
        }

        warn!(
            "no forwarding target for {} on {}",
            self.selectors.describe(selector),
            class.name()
        );

        if self.drops_unrecognized(receiver, class, selector) {
            trace!(
                "dropped {} on {}",
                self.selectors.describe(selector),
                class.name()
            );
            return Resolution::Dropped;
        }

        unrecognized
    }

    /// Stage 1.
    fn forwarded_method(
        &self,
        receiver: Receiver,
        class: Class,
        selector: SelectorId,
    ) -> Option<Method> {
        let hook = self.well_known.forwarded_method;
        if let Some(method) = class.lookup_method(hook) {
            let word = (method.imp())(receiver, hook, &[usize::from(selector.as_u16())]);
            // SAFETY: the forwarding protocol requires the imp to return 0 or
            // a Method word.
            if let Some(substitute) = unsafe { Method::from_word(word) } {
                return Some(substitute);
            }
        }

        let resolver = self.forwarding_resolver()?;
        resolver(receiver, selector)
    }

    /// Stage 2.
    fn drops_unrecognized(&self, receiver: Receiver, class: Class, selector: SelectorId) -> bool {
        let hook = self.well_known.drops_unrecognized;
        class.lookup_method(hook).is_some_and(|method| {
            (method.imp())(receiver, hook, &[usize::from(selector.as_u16())]) != 0
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::default()).unwrap()
    }

    fn finished(name: &str) -> Class {
        let class = Class::new_root(name);
        class.finish();
        class
    }

    fn sentinel(_: Receiver, _: SelectorId, _: &[usize]) -> usize {
        0x5EED
    }

    fn yes(_: Receiver, _: SelectorId, _: &[usize]) -> usize {
        1
    }

    fn no_substitute(_: Receiver, _: SelectorId, _: &[usize]) -> usize {
        0
    }

    #[test]
    fn test_forwarding_selectors_never_forward() {
        let rt = runtime();
        let class = finished("FwdSelf");
        let hook = rt.well_known().forwarded_method;

        assert_eq!(
            rt.forward(Receiver::Nil, class, hook),
            Resolution::Unrecognized {
                class,
                selector: hook
            }
        );
        assert!(matches!(
            rt.forward(Receiver::Nil, class, SelectorId::NULL),
            Resolution::Unrecognized { .. }
        ));
    }

    #[test]
    fn test_class_level_substitute() {
        static SUBSTITUTE: AtomicUsize = AtomicUsize::new(0);

        fn provide(_: Receiver, _: SelectorId, args: &[usize]) -> usize {
            assert_ne!(args[0], 0);
            SUBSTITUTE.load(Ordering::Acquire)
        }

        let rt = runtime();
        let class = finished("FwdClass");
        let missing = rt.register_selector("missing", "v16@0:8").unwrap();
        let substitute = Method::new_detached(missing, sentinel);
        SUBSTITUTE.store(substitute.as_word(), Ordering::Release);
        class.add_method(rt.well_known().forwarded_method, provide);

        let before = substitute.version();
        assert_eq!(
            rt.forward(Receiver::Nil, class, missing),
            Resolution::Forwarded(substitute)
        );
        assert_eq!(substitute.version(), before + 1);
    }

    #[test]
    fn test_runtime_resolver_is_consulted() {
        fn resolver(_: Receiver, selector: SelectorId) -> Option<Method> {
            Some(Method::new_detached(selector, sentinel))
        }

        let rt = runtime();
        let class = finished("FwdResolver");
        // A class hook that declines must fall through to the resolver.
        class.add_method(rt.well_known().forwarded_method, no_substitute);
        rt.set_forwarding_resolver(resolver);

        let missing = rt.register_selector("missing", "v16@0:8").unwrap();
        let resolution = rt.forward(Receiver::Nil, class, missing);
        let method = resolution.method().unwrap();
        assert_eq!((method.imp())(Receiver::Nil, missing, &[]), 0x5EED);
    }

    #[test]
    fn test_drop_stage() {
        let rt = runtime();
        let class = finished("FwdDrops");
        class.add_method(rt.well_known().drops_unrecognized, yes);

        let missing = rt.register_selector("missing", "v16@0:8").unwrap();
        assert_eq!(rt.forward(Receiver::Nil, class, missing), Resolution::Dropped);
    }

    #[test]
    fn test_nothing_installed_is_unrecognized() {
        let rt = runtime();
        let class = finished("FwdNothing");
        let missing = rt.register_selector("missing", "v16@0:8").unwrap();
        assert_eq!(
            rt.forward(Receiver::Nil, class, missing),
            Resolution::Unrecognized {
                class,
                selector: missing
            }
        );
    }

    #[test]
    fn test_depth_guard_limits_nesting() {
        let guards: Vec<_> = (0..MAX_FORWARDING_DEPTH)
            .map(|_| DepthGuard::enter().unwrap())
            .collect();
        assert!(DepthGuard::enter().is_none());
        drop(guards);
        assert!(DepthGuard::enter().is_some());
    }
}
