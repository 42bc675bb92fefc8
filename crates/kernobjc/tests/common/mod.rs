// Common test utilities for integration tests
//
// Shared runtime fixtures and counting method implementations.

#![allow(dead_code)]

use kernobjc::{Class, Receiver, Runtime, RuntimeConfig, SelectorId};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Type signature for a method without arguments and without a result.
pub const VOID: &str = "v16@0:8";

/// Type signature for a method without arguments returning a word.
pub const WORD: &str = "Q16@0:8";

/// Call counter for [`counting_imp`].
pub static COUNTING_CALLS: AtomicUsize = AtomicUsize::new(0);

static CLASS_ID: AtomicUsize = AtomicUsize::new(0);

/// Creates a runtime with the default configuration.
pub fn create_runtime() -> Runtime {
    Runtime::new(RuntimeConfig::default()).expect("Failed to create runtime")
}

/// Returns a class name that no other test uses.
pub fn unique_name(prefix: &str) -> String {
    format!("{prefix}_{}", CLASS_ID.fetch_add(1, Ordering::SeqCst))
}

/// Creates an unfinished root class with a unique name.
pub fn create_root_class(prefix: &str) -> Class {
    Class::new_root(&unique_name(prefix))
}

/// Creates an unfinished subclass of `super_class` with a unique name.
pub fn create_subclass(prefix: &str, super_class: Class) -> Class {
    Class::new(&unique_name(prefix), super_class)
}

/// Increments [`COUNTING_CALLS`] and returns the new count.
pub fn counting_imp(_: Receiver, _: SelectorId, _: &[usize]) -> usize {
    COUNTING_CALLS.fetch_add(1, Ordering::SeqCst) + 1
}

/// Returns 1.
pub fn returns_one(_: Receiver, _: SelectorId, _: &[usize]) -> usize {
    1
}

/// Returns 2.
pub fn returns_two(_: Receiver, _: SelectorId, _: &[usize]) -> usize {
    2
}

/// Returns 3.
pub fn returns_three(_: Receiver, _: SelectorId, _: &[usize]) -> usize {
    3
}

/// Returns the selector it was called with.
pub fn echo_selector(_: Receiver, cmd: SelectorId, _: &[usize]) -> usize {
    usize::from(cmd.as_u16())
}

/// Returns the receiver's small-object payload.
pub fn small_value(receiver: Receiver, _: SelectorId, _: &[usize]) -> usize {
    receiver.as_small().map_or(0, |small| small.value() as usize)
}
