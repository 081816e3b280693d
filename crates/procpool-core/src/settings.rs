//! Pool sizing/behavior knobs, independent of how they were obtained.
//!
//! `procpool-config` layers TOML/file loading on top of this; `procpool-core`
//! itself stays dependency-light and only needs the validated numbers.

use std::time::Duration;

use crate::charset::Charset;
use crate::error::PoolError;

/// Validated construction parameters for a [`crate::pool::ProcessPool`].
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub min_pool_size: usize,
    pub max_pool_size: usize,
    pub reserve_size: usize,
    pub keep_alive: Duration,
    pub verbose: bool,
    pub charset: Charset,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_pool_size: 0,
            max_pool_size: 1,
            reserve_size: 0,
            keep_alive: Duration::ZERO,
            verbose: false,
            charset: Charset::Latin1,
        }
    }
}

impl PoolSettings {
    /// Validate per spec.md §4.4: `maxPoolSize >= max(1, minPoolSize)`, and
    /// `0 <= reserveSize <= maxPoolSize`.
    pub fn validate(&self) -> Result<(), PoolError> {
        let min_required_max = self.min_pool_size.max(1);
        if self.max_pool_size < min_required_max {
            return Err(PoolError::InvalidConfiguration(format!(
                "max_pool_size ({}) must be >= max(1, min_pool_size) ({})",
                self.max_pool_size, min_required_max
            )));
        }
        if self.reserve_size > self.max_pool_size {
            return Err(PoolError::InvalidConfiguration(format!(
                "reserve_size ({}) must be <= max_pool_size ({})",
                self.reserve_size, self.max_pool_size
            )));
        }
        Ok(())
    }

    /// `s0 = max(minPoolSize, reserveSize)`, the number of shells the
    /// constructor spawns up front and blocks until `READY`.
    pub fn initial_size(&self) -> usize {
        self.min_pool_size.max(self.reserve_size)
    }

    /// `desired = clamp(max(minPoolSize, executing + queueDepth + reserve), 0, maxPoolSize)`.
    pub fn desired_size(&self, executing: usize, queue_depth: usize) -> usize {
        let demand = self
            .min_pool_size
            .max(executing.saturating_add(queue_depth).saturating_add(self.reserve_size));
        demand.min(self.max_pool_size)
    }
}
