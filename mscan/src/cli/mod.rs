//! Command-line interface

pub mod args;

pub use args::Args;

use anyhow::Result;

use crate::config::ScanConfig;

impl Args {
    /// Config file (or defaults) with command-line overrides applied
    ///
    /// # Errors
    /// Returns an error if the config file cannot be loaded
    pub fn scan_config(&self) -> Result<ScanConfig> {
        let mut config = match &self.config {
            Some(path) => ScanConfig::load(path)?,
            None => ScanConfig::default(),
        };
        if let Some(limit) = self.overlap_limit {
            config.overlap_limit = limit;
        }
        if let Some(limit) = self.label_miss_limit {
            config.label_miss_limit = limit;
        }
        if let Some(limit) = self.release_miss_limit {
            config.release_miss_limit = limit;
        }
        if let Some(limit) = self.acquired_miss_limit {
            config.acquired_miss_limit = limit;
        }
        if let Some(interval) = self.progress {
            config.progress_interval = interval;
        }
        Ok(config)
    }
}
