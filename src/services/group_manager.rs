//! Tender groups: a key prefix in the bucket plus a record in the index.
//!
//! Layout for group `g`:
//! - `g/<basename>` for the publication files
//! - `g/documents/<basename>` for supplementary documents
//!
//! The index is only touched after every upload of a call succeeded.

use crate::{
    config::IndexWriteMode,
    errors::{IndexError, IndexResult, StorageError},
    models::{
        index::GroupRecord,
        object::{BatchUploadReport, DownloadReceipt, DownloadTarget},
    },
    services::{
        metadata_index::MetadataIndex,
        storage_client::{BatchUploadOptions, ObjectStorageClient, object_path},
    },
};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const DOCUMENTS_DIR: &str = "documents";

#[derive(Debug)]
pub struct DocumentGroupManager {
    client: ObjectStorageClient,
    index: MetadataIndex,
}

impl DocumentGroupManager {
    pub fn new(index: MetadataIndex) -> Self {
        Self {
            client: index.client().clone(),
            index,
        }
    }

    /// Build the index over `client` (loading or creating it) and wrap it.
    pub async fn open(client: ObjectStorageClient, mode: IndexWriteMode) -> IndexResult<Self> {
        Ok(Self::new(MetadataIndex::open(client, mode).await?))
    }

    pub fn index(&self) -> &MetadataIndex {
        &self.index
    }

    pub fn client(&self) -> &ObjectStorageClient {
        &self.client
    }

    /// Upload `files` under `group_id/` and register the group with data
    /// `{"id": group_id}`.
    pub async fn create_group(
        &self,
        group_id: &str,
        files: &[PathBuf],
        publication: bool,
    ) -> IndexResult<BatchUploadReport> {
        self.create_group_with_data(group_id, files, publication, json!({ "id": group_id }))
            .await
    }

    /// Upload `files` under `group_id/` and register the group with `data`.
    ///
    /// An already registered group keeps its existing record; the files are
    /// still uploaded. If any upload fails the index is left untouched and
    /// `IncompleteUpload` is returned.
    pub async fn create_group_with_data(
        &self,
        group_id: &str,
        files: &[PathBuf],
        publication: bool,
        data: Value,
    ) -> IndexResult<BatchUploadReport> {
        validate_group_id(group_id)?;
        let report = self.upload(group_id, group_id.to_string(), files).await?;
        self.index
            .register_group(group_id, GroupRecord::new(publication, data))
            .await?;
        Ok(report)
    }

    /// Upload supplementary documents under `group_id/documents/` and flag
    /// the group. Unknown groups are rejected before anything is uploaded.
    pub async fn add_documents(
        &self,
        group_id: &str,
        files: &[PathBuf],
    ) -> IndexResult<BatchUploadReport> {
        validate_group_id(group_id)?;
        if self.index.group(group_id).await?.is_none() {
            // the cached copy may predate another writer's registration
            let fresh = self.index.refresh().await?;
            if !fresh.contains(group_id) {
                return Err(IndexError::UnknownGroup(group_id.to_string()));
            }
        }

        let prefix = format!("{}/{}", group_id, DOCUMENTS_DIR);
        let report = self.upload(group_id, prefix, files).await?;
        self.index.mark_documents_uploaded(group_id).await?;
        Ok(report)
    }

    /// Keys stored under `group_id/`, in listing order.
    pub async fn list_group_documents(&self, group_id: &str) -> IndexResult<Vec<String>> {
        validate_group_id(group_id)?;
        // the trailing slash keeps sibling groups such as `{id}0/` out
        let keys = self.client.list_objects(&format!("{}/", group_id)).await?;
        Ok(keys)
    }

    /// Download every object of the group below `dir`, keeping key paths.
    pub async fn download_group(
        &self,
        group_id: &str,
        dir: &Path,
    ) -> IndexResult<Vec<DownloadReceipt>> {
        let keys = self.list_group_documents(group_id).await?;
        let mut receipts = Vec::with_capacity(keys.len());
        for key in keys {
            let destination = key
                .split('/')
                .fold(dir.to_path_buf(), |path, segment| path.join(segment));
            let receipt = self
                .client
                .get_object(&key, DownloadTarget::Path(destination), None)
                .await?;
            receipts.push(receipt);
        }
        info!(
            "Downloaded {} objects of group `{}` to {}",
            receipts.len(),
            group_id,
            dir.display()
        );
        Ok(receipts)
    }

    async fn upload(
        &self,
        group_id: &str,
        key_prefix: String,
        files: &[PathBuf],
    ) -> IndexResult<BatchUploadReport> {
        let options = BatchUploadOptions {
            key_prefix: Some(key_prefix),
            ..Default::default()
        };
        let report = self.client.put_objects(files, &options).await;
        if !report.is_complete_success() {
            warn!(
                "{} of {} uploads for group `{}` failed, index not updated",
                report.failed(),
                report.total(),
                group_id
            );
            return Err(IndexError::IncompleteUpload {
                group_id: group_id.to_string(),
                failed: report.failed(),
                total: report.total(),
            });
        }
        Ok(report)
    }
}

/// Group ids are a single key segment.
fn validate_group_id(group_id: &str) -> IndexResult<()> {
    if group_id.contains('/') {
        return Err(StorageError::InvalidKey {
            key: group_id.to_string(),
            reason: "group id must not contain `/`".into(),
        }
        .into());
    }
    object_path(group_id)?;
    Ok(())
}
