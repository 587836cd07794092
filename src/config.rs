use std::path::PathBuf;

/// Configuration for a key-value store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Backing directory holding the block file and index generations
    pub dir: PathBuf,

    /// Payload bytes per block for a freshly created store (default: 128).
    /// Ignored when an existing store is restored.
    pub block_size: u32,

    /// Initial number of index rows for a freshly created store (default: 256).
    /// Ignored when an existing store is restored.
    pub initial_capacity: u32,

    /// Load factor of the newest index generation that triggers growth (default: 0.7)
    pub max_load_factor: f32,

    /// Number of stripes in the per-chain advisory lock table (default: 64)
    pub lock_stripes: usize,

    /// Reclaim blocks unreachable from any key when opening (default: false)
    pub sweep_on_open: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./blockkv"),
            block_size: 128,
            initial_capacity: 256,
            max_load_factor: 0.7,
            lock_stripes: 64,
            sweep_on_open: false,
        }
    }
}

impl StoreConfig {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set block payload size
    pub fn block_size(mut self, size: u32) -> Self {
        self.block_size = size;
        self
    }

    /// Set initial index capacity
    pub fn initial_capacity(mut self, capacity: u32) -> Self {
        self.initial_capacity = capacity;
        self
    }

    /// Set the maximum load factor before the index splits
    pub fn max_load_factor(mut self, factor: f32) -> Self {
        self.max_load_factor = factor;
        self
    }

    /// Set the number of lock stripes
    pub fn lock_stripes(mut self, stripes: usize) -> Self {
        self.lock_stripes = stripes;
        self
    }

    /// Enable the leaked-block sweep at open
    pub fn sweep_on_open(mut self, enabled: bool) -> Self {
        self.sweep_on_open = enabled;
        self
    }

    pub(crate) fn validate(&self) -> crate::Result<()> {
        // The length header must fit in the first block.
        if self.block_size < 8 {
            return Err(crate::Error::InvalidState(format!(
                "block size {} is below the minimum of 8",
                self.block_size
            )));
        }
        if self.initial_capacity == 0 {
            return Err(crate::Error::InvalidState(
                "initial capacity must be non-zero".to_string(),
            ));
        }
        if !(self.max_load_factor > 0.0 && self.max_load_factor < 1.0) {
            return Err(crate::Error::InvalidState(format!(
                "load factor {} must be within (0, 1)",
                self.max_load_factor
            )));
        }
        if self.lock_stripes == 0 {
            return Err(crate::Error::InvalidState(
                "lock stripe count must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StoreConfig::default();
        assert_eq!(config.dir, PathBuf::from("./blockkv"));
        assert_eq!(config.block_size, 128);
        assert_eq!(config.initial_capacity, 256);
        assert_eq!(config.max_load_factor, 0.7);
        assert_eq!(config.lock_stripes, 64);
        assert!(!config.sweep_on_open);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = StoreConfig::new("/tmp/test")
            .block_size(100)
            .initial_capacity(16)
            .max_load_factor(0.5)
            .lock_stripes(8)
            .sweep_on_open(true);

        assert_eq!(config.dir, PathBuf::from("/tmp/test"));
        assert_eq!(config.block_size, 100);
        assert_eq!(config.initial_capacity, 16);
        assert_eq!(config.max_load_factor, 0.5);
        assert_eq!(config.lock_stripes, 8);
        assert!(config.sweep_on_open);
    }

    #[test]
    fn test_invalid_config() {
        assert!(StoreConfig::new("/tmp/x").block_size(4).validate().is_err());
        assert!(StoreConfig::new("/tmp/x").initial_capacity(0).validate().is_err());
        assert!(StoreConfig::new("/tmp/x").max_load_factor(1.0).validate().is_err());
        assert!(StoreConfig::new("/tmp/x").lock_stripes(0).validate().is_err());
    }
}
