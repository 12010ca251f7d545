//! Heap-proportional sizing of in-memory caches and queues
//!
//! Reference sizes are tuned for a 910 MB budget of which 150 MB is
//! reserved. Other budgets scale them linearly, never below 20%.

use crate::config::{reserved_mb_from_env, CacheSettings};
use crate::error::{Error, Result};

/// Budget the reference sizes were chosen for
pub const DEFAULT_SIZES_MAX_HEAP_MB: u64 = 910;

/// Part of the budget never available to caches
pub const DEFAULT_RESERVED_HEAP_MB: u64 = 150;

/// Default rounding step of scaled sizes
pub const DEFAULT_GRANULARITY: usize = 100;

const MIN_SIZING_RATIO: f64 = 0.2;

/// Scales reference cache sizes to the configured memory budget
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeapProportionalCacheSizer {
    sizing_ratio: f64,
}

impl HeapProportionalCacheSizer {
    /// Sizer for `budget_mb`, with the reserved part taken from the environment
    pub fn new(budget_mb: u64) -> Self {
        Self::with_reserved(
            budget_mb,
            reserved_mb_from_env().unwrap_or(DEFAULT_RESERVED_HEAP_MB),
        )
    }

    pub fn with_reserved(budget_mb: u64, reserved_mb: u64) -> Self {
        let available = budget_mb.saturating_sub(reserved_mb) as f64;
        let reference = (DEFAULT_SIZES_MAX_HEAP_MB - DEFAULT_RESERVED_HEAP_MB) as f64;
        Self {
            sizing_ratio: (available / reference).max(MIN_SIZING_RATIO),
        }
    }

    pub fn from_settings(settings: &CacheSettings) -> Self {
        Self::new(settings.memory_budget_mb)
    }

    pub fn sizing_ratio(&self) -> f64 {
        self.sizing_ratio
    }

    /// Scale `reference` using the default granularity
    pub fn scale_cache_size(&self, reference: usize) -> usize {
        self.scale(reference.max(DEFAULT_GRANULARITY), DEFAULT_GRANULARITY)
    }

    /// Scale `reference`, rounding down to a multiple of `granularity`
    pub fn scale_cache_size_with(&self, reference: usize, granularity: usize) -> Result<usize> {
        if granularity == 0 || reference < granularity {
            return Err(Error::Config(format!(
                "reference value {} must not be smaller than granularity {}",
                reference, granularity
            )));
        }
        Ok(self.scale(reference, granularity))
    }

    fn scale(&self, reference: usize, granularity: usize) -> usize {
        let scaled = (reference as f64 * self.sizing_ratio) as usize / granularity * granularity;
        scaled.max(granularity)
    }
}
