//! The fatal error path.
//!
//! There is no unwinding exception channel in this runtime. Invariant
//! violations (conflicting selector types, finishing a class twice, a message
//! nobody understands) end here: the error is logged, a backtrace is printed
//! when the `abort_backtrace` feature is on, and the installed
//! [`AbortHandler`] takes over. It never returns.
//!
//! The default handler panics with the diagnostic, which lets hosted tests
//! observe the abort path. A kernel or a production process installs
//! [`abort_process`] or its own handler.

use crate::error::Error;
use kernobjc_log::error;
use std::sync::RwLock;

/// Called with the error that made the runtime give up. Must not return.
pub type AbortHandler = fn(&Error) -> !;

static ABORT_HANDLER: RwLock<Option<AbortHandler>> = RwLock::new(None);

/// Installs `handler` for all runtimes in the process.
pub fn set_abort_handler(handler: AbortHandler) {
    let mut slot = ABORT_HANDLER.write().unwrap_or_else(|e| e.into_inner());
    *slot = Some(handler);
}

/// Restores the default panicking handler.
pub fn clear_abort_handler() {
    let mut slot = ABORT_HANDLER.write().unwrap_or_else(|e| e.into_inner());
    *slot = None;
}

/// Handler that terminates the process immediately.
pub fn abort_process(_error: &Error) -> ! {
    std::process::abort()
}

/// Reports `err` and hands control to the abort handler.
///
/// # Panics
///
/// Panics with the diagnostic when no handler is installed.
#[cold]
#[inline(never)]
pub fn fatal(err: Error) -> ! {
    error!("fatal runtime error: {err}");

    #[cfg(feature = "abort_backtrace")]
    error!("{:?}", backtrace::Backtrace::new());

    let handler = *ABORT_HANDLER.read().unwrap_or_else(|e| e.into_inner());
    match handler {
        Some(handler) => handler(&err),
        None => panic!("kernobjc: {err}"),
    }
}

/// Turns a `Result` from a `try_*` entry point into its fatal form.
pub(crate) trait OrAbort<T> {
    fn or_abort(self) -> T;
}

impl<T> OrAbort<T> for Result<T, Error> {
    #[inline]
    fn or_abort(self) -> T {
        match self {
            Ok(value) => value,
            Err(err) => fatal(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "kernobjc: Class 'Point' is already finished")]
    fn test_default_handler_panics_with_diagnostic() {
        fatal(Error::ClassAlreadyFinished {
            class: "Point".into(),
        });
    }

    #[test]
    fn test_or_abort_passes_values_through() {
        let ok: Result<u32, Error> = Ok(7);
        assert_eq!(ok.or_abort(), 7);
    }
}
