//! How a single object is moved over the wire.

use serde::Serialize;

/// Derived per transfer, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransferPlan {
    /// Split the object into independently sent parts.
    pub use_multipart: bool,

    /// Part size in bytes. Also the fallback chunk for single-shot plans.
    pub chunk_size: u64,

    /// Upper bound on parts in flight.
    pub max_concurrency: usize,
}

impl TransferPlan {
    /// Number of parts an object of `size` bytes is cut into.
    pub fn part_count(&self, size: u64) -> u64 {
        if size == 0 {
            return 1;
        }
        size.div_ceil(self.chunk_size.max(1))
    }
}
