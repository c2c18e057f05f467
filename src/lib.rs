//! Resilient S3-compatible document storage for tender groups.
//!
//! `ObjectStorageClient` wraps one bucket with retries, transfer planning and
//! key validation. `MetadataIndex` keeps the `bucket_metadata.json` catalog and
//! `DocumentGroupManager` ties uploads and catalog entries together.

pub mod config;
pub mod errors;
pub mod models;
pub mod services;

pub use config::{ConfigOverrides, IndexWriteMode, StorageConfig};
pub use errors::{ErrorKind, IndexError, IndexResult, StorageError, StorageResult, TransientCode};
pub use models::{
    index::{GroupRecord, INDEX_KEY, IndexDocument},
    object::{
        BatchUploadReport, DownloadReceipt, DownloadTarget, ObjectInfo, ProgressCallback,
        UploadOptions, UploadReceipt, UploadSource,
    },
    transfer::TransferPlan,
};
pub use services::{
    group_manager::DocumentGroupManager,
    metadata_index::MetadataIndex,
    retry::RetryPolicy,
    storage_client::{BatchUploadOptions, HealthReport, ObjectStorageClient, WriteCondition},
    transfer_planner::TransferPlanner,
};
