//! Scan tolerances
//!
//! Loaded from an optional JSON file; any field left out keeps its default.
//!
//! ```json
//! { "overlap_limit": 50, "label_miss_limit": 1000, "progress_interval": 0 }
//! ```

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::locks::lock_manager::{DEFAULT_ACQUIRED_MISS_LIMIT, DEFAULT_RELEASE_MISS_LIMIT};
use crate::locks::LockLimits;
use crate::objects::label_map::{DEFAULT_CACHELINE, DEFAULT_MISS_LIMIT, DEFAULT_OVERLAP_LIMIT};
use crate::objects::IndexLimits;

/// Records between progress log lines
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 10_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScanConfig {
    /// Overlapping labels dropped before the scan gives up
    pub overlap_limit: u64,
    /// Unmatched label removals tolerated per label class
    pub label_miss_limit: u64,
    /// Releases of unheld locks tolerated
    pub release_miss_limit: u64,
    /// `acquired` records without an `acquire` tolerated
    pub acquired_miss_limit: u64,
    /// Cache-line size in bytes, a power of two
    pub cacheline: u64,
    /// 0 disables progress logging
    pub progress_interval: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            overlap_limit: DEFAULT_OVERLAP_LIMIT,
            label_miss_limit: DEFAULT_MISS_LIMIT,
            release_miss_limit: DEFAULT_RELEASE_MISS_LIMIT,
            acquired_miss_limit: DEFAULT_ACQUIRED_MISS_LIMIT,
            cacheline: DEFAULT_CACHELINE,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

impl ScanConfig {
    /// Read a JSON config file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, is not valid JSON, names
    /// an unknown field, or sets a cache-line size that is not a power of two
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns an error for a cache-line size that is not a power of two
    pub fn validate(&self) -> Result<()> {
        if !self.cacheline.is_power_of_two() {
            anyhow::bail!("cacheline must be a power of two, got {}", self.cacheline);
        }
        Ok(())
    }

    #[must_use]
    pub fn index_limits(&self) -> IndexLimits {
        IndexLimits {
            overlaps: self.overlap_limit,
            misses_per_class: self.label_miss_limit,
            cacheline: self.cacheline,
        }
    }

    #[must_use]
    pub fn lock_limits(&self) -> LockLimits {
        LockLimits {
            release_misses: self.release_miss_limit,
            acquired_misses: self.acquired_miss_limit,
        }
    }
}
