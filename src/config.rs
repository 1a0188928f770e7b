use std::path::PathBuf;

/// Configuration for the Bitcask engine.
#[derive(Debug, Clone)]
pub struct BitcaskConfig {
    /// Path of the log file. Parent directories are created on open.
    pub path: PathBuf,

    /// Fsync the log after every write (default: false). Without this,
    /// durability requires an explicit flush.
    pub sync_every_write: bool,

    /// Compact the log on open when at least this fraction of the file is
    /// garbage (default: None, never compact on open).
    pub compact_min_garbage_fraction: Option<f64>,
}

impl BitcaskConfig {
    /// Create a new config for the given log file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sync_every_write: false,
            compact_min_garbage_fraction: None,
        }
    }

    /// Fsync after every write.
    pub fn sync_every_write(mut self, enabled: bool) -> Self {
        self.sync_every_write = enabled;
        self
    }

    /// Compact on open when the garbage fraction reaches the threshold.
    pub fn compact_min_garbage_fraction(mut self, fraction: f64) -> Self {
        self.compact_min_garbage_fraction = Some(fraction);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = BitcaskConfig::new("/tmp/ember/db");
        assert_eq!(config.path, PathBuf::from("/tmp/ember/db"));
        assert!(!config.sync_every_write);
        assert_eq!(config.compact_min_garbage_fraction, None);
    }

    #[test]
    fn config_builder() {
        let config = BitcaskConfig::new("/tmp/ember/db")
            .sync_every_write(true)
            .compact_min_garbage_fraction(0.2);

        assert!(config.sync_every_write);
        assert_eq!(config.compact_min_garbage_fraction, Some(0.2));
    }
}
