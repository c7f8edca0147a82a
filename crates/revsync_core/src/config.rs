//! Store configuration.

/// Configuration for opening a revision store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Whether to `fsync` the log after every record (safer but slower).
    pub sync_on_write: bool,

    /// Largest body accepted for a single revision.
    pub max_body_size: usize,

    /// Whether to re-run conflict resolution for every document on open.
    ///
    /// Repairs documents whose winner record was lost to a crash between a
    /// revision append and the winner flip.
    pub resolve_on_open: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sync_on_write: true,
            max_body_size: 16 * 1024 * 1024, // 16 MB
            resolve_on_open: true,
        }
    }
}

impl StoreConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to sync the log after every record.
    #[must_use]
    pub const fn sync_on_write(mut self, value: bool) -> Self {
        self.sync_on_write = value;
        self
    }

    /// Sets the maximum body size.
    #[must_use]
    pub const fn max_body_size(mut self, size: usize) -> Self {
        self.max_body_size = size;
        self
    }

    /// Sets whether to re-resolve every document on open.
    #[must_use]
    pub const fn resolve_on_open(mut self, value: bool) -> Self {
        self.resolve_on_open = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = StoreConfig::default();
        assert!(config.sync_on_write);
        assert!(config.resolve_on_open);
        assert_eq!(config.max_body_size, 16 * 1024 * 1024);
    }

    #[test]
    fn builder_pattern() {
        let config = StoreConfig::new()
            .sync_on_write(false)
            .max_body_size(1024)
            .resolve_on_open(false);

        assert!(!config.sync_on_write);
        assert!(!config.resolve_on_open);
        assert_eq!(config.max_body_size, 1024);
    }
}
