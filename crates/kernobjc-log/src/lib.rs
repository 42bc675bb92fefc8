//! Leveled logging for the `kernobjc` runtime.
//!
//! The runtime has to run both as a hosted library and inside a kernel, so the
//! logger never assumes a terminal. Every record goes through a [`Sink`], a
//! plain function pointer that the embedder can swap at any time. The default
//! sink writes coloured lines to stderr.
//!
//! # Example
//!
//! ```
//! use kernobjc_log::{debug, error, info, warn, Level};
//!
//! kernobjc_log::set_level(Level::Debug);
//!
//! let selector = "retain";
//! info!("registered selector {}", selector);
//! debug!("selector table: {:?}", vec![1, 2, 3]);
//! warn!("class does not respond to {}", selector);
//! error!("fatal runtime error");
//! ```

use std::fmt::Arguments;
use std::io::Write;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

/// Log levels representing the severity/priority of log messages.
///
/// Lower numeric values indicate higher severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    /// Unrecoverable runtime errors, logged right before an abort.
    Error = 0,
    /// Recoverable oddities (forwarding misses, ignored config values).
    Warn = 1,
    /// Lifecycle events.
    Info = 2,
    /// Class and selector construction.
    Debug = 3,
    /// Per-dispatch tracing.
    Trace = 4,
}

impl Level {
    const fn color_code(&self) -> &'static str {
        match self {
            Level::Error => "\x1b[31m",
            Level::Warn => "\x1b[33m",
            Level::Info => "\x1b[32m",
            Level::Debug => "\x1b[36m",
            Level::Trace => "\x1b[35m",
        }
    }

    /// Returns the string representation of this log level.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    const fn from_u8(value: u8) -> Level {
        match value {
            0 => Level::Error,
            1 => Level::Warn,
            2 => Level::Info,
            3 => Level::Debug,
            _ => Level::Trace,
        }
    }

    /// Parses a string into a Level, ignoring case.
    ///
    /// # Example
    ///
    /// ```
    /// use kernobjc_log::Level;
    ///
    /// assert_eq!(Level::from_str("error"), Ok(Level::Error));
    /// assert_eq!(Level::from_str("INFO"), Ok(Level::Info));
    /// assert!(Level::from_str("loud").is_err());
    /// ```
    ///
    /// # Errors
    ///
    /// Returns a message naming the input if it is not a level name.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, String> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ERROR" => Ok(Level::Error),
            "WARN" | "WARNING" => Ok(Level::Warn),
            "INFO" => Ok(Level::Info),
            "DEBUG" => Ok(Level::Debug),
            "TRACE" => Ok(Level::Trace),
            _ => Err(format!("Invalid log level: {s}")),
        }
    }
}

/// A single log record handed to the sink.
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    /// Severity of the record.
    pub level: Level,
    /// Module path of the call site.
    pub target: &'a str,
    /// The formatted message, not yet rendered.
    pub args: Arguments<'a>,
}

/// Destination for log records.
///
/// A sink must not call back into the runtime; it may be invoked while
/// runtime locks are held.
pub type Sink = fn(&Record<'_>);

/// Writes `[LEVEL] target: message` to stderr.
pub fn stderr_sink(record: &Record<'_>) {
    const RESET: &str = "\x1b[0m";
    let color = record.level.color_code();
    let level = record.level.as_str();
    // A failed diagnostic write has nowhere else to go.
    let _ = writeln!(
        std::io::stderr().lock(),
        "{color}[{level}]{RESET} {}: {}",
        record.target,
        record.args
    );
}

/// Discards every record.
pub fn null_sink(_record: &Record<'_>) {}

/// The process-wide logger.
///
/// Level and sink are both atomics, so they can be changed from any thread
/// without locking the logging fast path.
pub struct Logger {
    level: AtomicU8,
    sink: AtomicPtr<()>,
}

impl Logger {
    fn new(level: Level, sink: Sink) -> Self {
        Logger {
            level: AtomicU8::new(level as u8),
            sink: AtomicPtr::new(sink as *mut ()),
        }
    }

    /// Sets the minimum log level.
    pub fn set_level(&self, level: Level) {
        self.level.store(level as u8, Ordering::SeqCst);
    }

    /// Returns the current minimum log level.
    pub fn level(&self) -> Level {
        Level::from_u8(self.level.load(Ordering::Relaxed))
    }

    /// Checks if a message at the given level would be logged.
    pub fn enabled(&self, level: Level) -> bool {
        level as u8 <= self.level.load(Ordering::Relaxed)
    }

    /// Replaces the sink, returning the previous one.
    pub fn set_sink(&self, sink: Sink) -> Sink {
        let previous = self.sink.swap(sink as *mut (), Ordering::AcqRel);
        // SAFETY: the pointer was stored from a `Sink` by `new` or `set_sink`.
        unsafe { std::mem::transmute::<*mut (), Sink>(previous) }
    }

    fn sink(&self) -> Sink {
        let raw = self.sink.load(Ordering::Acquire);
        // SAFETY: the pointer was stored from a `Sink` by `new` or `set_sink`.
        unsafe { std::mem::transmute::<*mut (), Sink>(raw) }
    }
}

static LOGGER: OnceLock<Logger> = OnceLock::new();

/// Returns the global logger, creating it at `Level::Info` on first use.
pub fn get_logger() -> &'static Logger {
    LOGGER.get_or_init(|| Logger::new(Level::Info, stderr_sink))
}

/// Sets the minimum log level for the global logger.
pub fn set_level(level: Level) {
    get_logger().set_level(level);
}

/// Sets the minimum log level from a string.
///
/// # Errors
///
/// Returns an error if `s` is not a level name; the level is left unchanged.
pub fn set_level_from_str(s: &str) -> Result<(), String> {
    let level = Level::from_str(s)?;
    set_level(level);
    Ok(())
}

/// Routes all subsequent records to `sink`. Returns the previous sink.
///
/// # Example
///
/// ```
/// use kernobjc_log::{Record, set_sink, stderr_sink};
///
/// fn console(record: &Record<'_>) {
///     let _ = record.level;
/// }
///
/// let previous = set_sink(console);
/// set_sink(previous);
/// # let _ = stderr_sink;
/// ```
pub fn set_sink(sink: Sink) -> Sink {
    get_logger().set_sink(sink)
}

/// Applies the level named by the environment variable `var`, if it is set
/// and valid. Returns the level in effect afterwards.
pub fn init_from_env(var: &str) -> Level {
    if let Ok(value) = std::env::var(var) {
        if let Err(err) = set_level_from_str(&value) {
            __log_with_target(
                Level::Warn,
                module_path!(),
                format_args!("ignoring {var}: {err}"),
            );
        }
    }
    get_logger().level()
}

#[doc(hidden)]
pub fn __log_with_target(level: Level, target: &str, args: Arguments<'_>) {
    let logger = get_logger();
    if !logger.enabled(level) {
        return;
    }
    let sink = logger.sink();
    sink(&Record {
        level,
        target,
        args,
    });
}

/// The primary logging macro.
///
/// # Example
///
/// ```
/// use kernobjc_log::{log, Level};
///
/// log!(level: Level::Info, "selector table holds {} entries", 42);
/// ```
#[macro_export]
macro_rules! log {
    (level: $level:expr, $($arg:tt)*) => {
        {
            if $crate::get_logger().enabled($level) {
                $crate::__log_with_target(
                    $level,
                    module_path!(),
                    format_args!($($arg)*)
                );
            }
        }
    };
}

/// Logs a message at the Error level.
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Error, $($arg)*)
    };
}

/// Logs a message at the Warn level.
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Warn, $($arg)*)
    };
}

/// Logs a message at the Info level.
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Info, $($arg)*)
    };
}

/// Logs a message at the Debug level.
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Debug, $($arg)*)
    };
}

/// Logs a message at the Trace level.
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Trace, $($arg)*)
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    // Tests below mutate the global logger.
    static GLOBAL: Mutex<()> = Mutex::new(());

    static CAPTURED: AtomicUsize = AtomicUsize::new(0);

    fn counting_sink(record: &Record<'_>) {
        assert!(!record.target.is_empty());
        CAPTURED.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_level_ordering() {
        assert!(Level::Error < Level::Warn);
        assert!(Level::Warn < Level::Info);
        assert!(Level::Info < Level::Debug);
        assert!(Level::Debug < Level::Trace);
    }

    #[test]
    fn test_level_from_str() {
        assert_eq!(Level::from_str("error"), Ok(Level::Error));
        assert_eq!(Level::from_str("WARN"), Ok(Level::Warn));
        assert_eq!(Level::from_str("warning"), Ok(Level::Warn));
        assert_eq!(Level::from_str(" Info "), Ok(Level::Info));
        assert_eq!(Level::from_str("DEBUG"), Ok(Level::Debug));
        assert_eq!(Level::from_str("trace"), Ok(Level::Trace));
        assert!(Level::from_str("invalid").is_err());
    }

    #[test]
    fn test_logger_level_filtering() {
        let logger = Logger::new(Level::Info, null_sink);

        assert!(logger.enabled(Level::Error));
        assert!(logger.enabled(Level::Info));
        assert!(!logger.enabled(Level::Debug));

        logger.set_level(Level::Trace);
        assert!(logger.enabled(Level::Trace));
        assert_eq!(logger.level(), Level::Trace);
    }

    #[test]
    fn test_sink_receives_enabled_records_only() {
        let _guard = GLOBAL.lock().unwrap();
        set_level(Level::Info);
        let previous = set_sink(counting_sink);
        let before = CAPTURED.load(Ordering::SeqCst);

        info!("counted");
        debug!("filtered");
        warn!("counted too");

        set_sink(previous);
        assert_eq!(CAPTURED.load(Ordering::SeqCst) - before, 2);
    }

    #[test]
    fn test_set_level_from_str() {
        let _guard = GLOBAL.lock().unwrap();
        set_level_from_str("debug").unwrap();
        assert_eq!(get_logger().level(), Level::Debug);

        assert!(set_level_from_str("invalid").is_err());
        assert_eq!(get_logger().level(), Level::Debug);
        set_level(Level::Info);
    }

    #[test]
    fn test_init_from_env_unset_keeps_level() {
        let _guard = GLOBAL.lock().unwrap();
        set_level(Level::Warn);
        let level = init_from_env("KERNOBJC_LOG_TEST_UNSET_VARIABLE");
        assert_eq!(level, Level::Warn);
        set_level(Level::Info);
    }

    #[test]
    fn test_thread_safety() {
        let _guard = GLOBAL.lock().unwrap();
        let previous = set_sink(null_sink);
        let handles: Vec<_> = (0..8)
            .map(|i| std::thread::spawn(move || info!("thread {} message", i)))
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        set_sink(previous);
    }
}
