//! Chooses between single-shot and multipart transfer from the object size.
//! The same planner drives uploads and downloads.

use crate::{
    errors::{StorageError, StorageResult},
    models::transfer::TransferPlan,
};

pub const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferPlanner {
    /// Objects strictly larger than this are sent in parts.
    multipart_threshold: u64,
    min_chunk: u64,
    max_chunk: u64,
    /// Chunk sizes are rounded up to a multiple of this.
    alignment: u64,
    target_parts: u64,
    max_concurrency: usize,
}

impl Default for TransferPlanner {
    fn default() -> Self {
        Self {
            multipart_threshold: 100 * MIB,
            min_chunk: 10 * MIB,
            max_chunk: 100 * MIB,
            alignment: MIB,
            target_parts: 10,
            max_concurrency: 10,
        }
    }
}

impl TransferPlanner {
    /// Build a planner from explicit limits.
    ///
    /// Every limit must be positive and `min_chunk <= max_chunk`.
    pub fn new(
        multipart_threshold: u64,
        min_chunk: u64,
        max_chunk: u64,
        alignment: u64,
        target_parts: u64,
        max_concurrency: usize,
    ) -> StorageResult<Self> {
        let limits = [
            ("multipart_threshold", multipart_threshold),
            ("min_chunk", min_chunk),
            ("max_chunk", max_chunk),
            ("alignment", alignment),
            ("target_parts", target_parts),
            ("max_concurrency", max_concurrency as u64),
        ];
        if let Some((name, _)) = limits.iter().find(|(_, value)| *value == 0) {
            return Err(StorageError::Configuration(format!(
                "transfer planner `{}` must be greater than zero",
                name
            )));
        }
        if min_chunk > max_chunk {
            return Err(StorageError::Configuration(format!(
                "transfer planner min_chunk ({}) exceeds max_chunk ({})",
                min_chunk, max_chunk
            )));
        }
        Ok(Self {
            multipart_threshold,
            min_chunk,
            max_chunk,
            alignment,
            target_parts,
            max_concurrency,
        })
    }

    pub fn multipart_threshold(&self) -> u64 {
        self.multipart_threshold
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Plan a transfer of `size` bytes; `None` means the size is unknown.
    pub fn plan(&self, size: Option<u64>) -> TransferPlan {
        match size {
            Some(size) if size > self.multipart_threshold => {
                let raw = size.div_ceil(self.target_parts);
                let clamped = raw.clamp(self.min_chunk, self.max_chunk);
                TransferPlan {
                    use_multipart: true,
                    chunk_size: clamped.div_ceil(self.alignment) * self.alignment,
                    max_concurrency: self.max_concurrency,
                }
            }
            _ => TransferPlan {
                use_multipart: false,
                chunk_size: self.min_chunk,
                max_concurrency: self.max_concurrency,
            },
        }
    }
}
