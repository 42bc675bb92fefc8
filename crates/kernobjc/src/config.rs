//! Runtime configuration.
//!
//! A [`RuntimeConfig`] fixes the resource limits of one [`Runtime`](crate::Runtime):
//! how many selectors it may intern and how much string storage backs them.
//! Hosted programs usually start from [`RuntimeConfig::from_env`]; a kernel
//! embedding builds the struct directly.

use crate::error::{Error, Result};
use kernobjc_log::{Level, warn};

/// Environment variable holding the log level.
pub const ENV_LOG: &str = "KERNOBJC_LOG";
/// Environment variable overriding [`RuntimeConfig::max_selectors`].
pub const ENV_MAX_SELECTORS: &str = "KERNOBJC_MAX_SELECTORS";
/// Environment variable overriding [`RuntimeConfig::max_selector_pages`].
pub const ENV_SELECTOR_PAGES: &str = "KERNOBJC_SELECTOR_PAGES";

/// Default page size of the selector string storage.
pub const DEFAULT_SELECTOR_PAGE_SIZE: usize = 8 * 1024;
/// Default number of pages the selector string storage may use.
pub const DEFAULT_MAX_SELECTOR_PAGES: usize = 384;

/// Limits and settings for one runtime instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Highest selector id that may be handed out. Ids start at 1.
    pub max_selectors: u16,
    /// Size of one page of selector string storage, in bytes.
    pub selector_page_size: usize,
    /// Number of pages the selector string storage may grow to.
    pub max_selector_pages: usize,
    /// Log level applied when the runtime starts, if any.
    pub log_level: Option<Level>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            max_selectors: u16::MAX,
            selector_page_size: DEFAULT_SELECTOR_PAGE_SIZE,
            max_selector_pages: DEFAULT_MAX_SELECTOR_PAGES,
            log_level: None,
        }
    }
}

impl RuntimeConfig {
    /// Builds a configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary variable lookup.
    ///
    /// Values that do not parse are ignored with a warning and the default
    /// is kept.
    ///
    /// # Example
    ///
    /// ```
    /// use kernobjc::RuntimeConfig;
    ///
    /// let config = RuntimeConfig::from_vars(|key| match key {
    ///     "KERNOBJC_MAX_SELECTORS" => Some("512".to_string()),
    ///     _ => None,
    /// });
    /// assert_eq!(config.max_selectors, 512);
    /// ```
    pub fn from_vars<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = RuntimeConfig::default();

        if let Some(value) = lookup(ENV_LOG) {
            match Level::from_str(&value) {
                Ok(level) => config.log_level = Some(level),
                Err(err) => warn!("ignoring {ENV_LOG}: {err}"),
            }
        }

        if let Some(value) = lookup(ENV_MAX_SELECTORS) {
            match value.trim().parse::<u16>() {
                Ok(max) => config.max_selectors = max,
                Err(err) => warn!("ignoring {ENV_MAX_SELECTORS}={value}: {err}"),
            }
        }

        if let Some(value) = lookup(ENV_SELECTOR_PAGES) {
            match value.trim().parse::<usize>() {
                Ok(pages) => config.max_selector_pages = pages,
                Err(err) => warn!("ignoring {ENV_SELECTOR_PAGES}={value}: {err}"),
            }
        }

        config
    }

    /// Sets the selector id limit.
    #[must_use]
    pub fn with_max_selectors(mut self, max: u16) -> Self {
        self.max_selectors = max;
        self
    }

    /// Sets the selector string storage limit.
    #[must_use]
    pub fn with_selector_storage(mut self, page_size: usize, max_pages: usize) -> Self {
        self.selector_page_size = page_size;
        self.max_selector_pages = max_pages;
        self
    }

    /// Sets the log level applied at startup.
    #[must_use]
    pub fn with_log_level(mut self, level: Level) -> Self {
        self.log_level = Some(level);
        self
    }

    /// Checks that the limits leave room for the runtime's own selectors.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SelectorTableExhausted`] if no selector ids are
    /// available, or [`Error::StringStorageExhausted`] if no string pages are.
    pub fn validate(&self) -> Result<()> {
        if self.max_selectors == 0 {
            return Err(Error::SelectorTableExhausted { max: 0 });
        }
        if self.max_selector_pages == 0 {
            return Err(Error::StringStorageExhausted {
                name: String::new(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| (*v).to_string())
        }
    }

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.max_selectors, u16::MAX);
        assert_eq!(config.max_selector_pages, 384);
        assert!(config.log_level.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_vars_reads_all_keys() {
        let config = RuntimeConfig::from_vars(vars(&[
            ("KERNOBJC_LOG", "debug"),
            ("KERNOBJC_MAX_SELECTORS", "1000"),
            ("KERNOBJC_SELECTOR_PAGES", "4"),
        ]));
        assert_eq!(config.log_level, Some(Level::Debug));
        assert_eq!(config.max_selectors, 1000);
        assert_eq!(config.max_selector_pages, 4);
    }

    #[test]
    fn test_from_vars_ignores_garbage() {
        let config = RuntimeConfig::from_vars(vars(&[
            ("KERNOBJC_LOG", "chatty"),
            ("KERNOBJC_MAX_SELECTORS", "70000"),
            ("KERNOBJC_SELECTOR_PAGES", "many"),
        ]));
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn test_validate_rejects_empty_limits() {
        assert!(RuntimeConfig::default().with_max_selectors(0).validate().is_err());
        assert!(
            RuntimeConfig::default()
                .with_selector_storage(4096, 0)
                .validate()
                .is_err()
        );
    }
}
