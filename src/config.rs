//! Cache construction parameters.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::bitmap::CACHE_LINE_SIZE;

/// Invalid cache configuration.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("fast dispatch table size {0:#x} is not a power of two")]
    FastTableNotPowerOfTwo(usize),

    #[error("physical window size {0:#x} is not cache-line aligned")]
    WindowNotLineAligned(u64),
}

/// Construction parameters for a [`crate::cache::BlockCache`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Number of fast-dispatch slots. Must be a power of two; the dispatch
    /// index is computed by masking, not modulo.
    pub fast_table_entries: usize,
    /// Base of the physical window tracked by the validity bitmap.
    pub valid_window_base: u64,
    /// Size of the physical window tracked by the validity bitmap.
    /// Must be cache-line aligned.
    pub valid_window_size: u64,
    /// Directory for perf-map output. `None` disables profiler registration
    /// through [`crate::profiler::PerfMapProfiler`].
    pub perf_dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            fast_table_entries: 0x10000,
            valid_window_base: 0,
            valid_window_size: 0x2000_0000, // 512 MiB of guest physical space
            perf_dir: None,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.fast_table_entries.is_power_of_two() {
            return Err(ConfigError::FastTableNotPowerOfTwo(self.fast_table_entries));
        }
        if self.valid_window_size & (CACHE_LINE_SIZE - 1) != 0 {
            return Err(ConfigError::WindowNotLineAligned(self.valid_window_size));
        }
        Ok(())
    }
}
