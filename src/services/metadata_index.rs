//! The bucket's JSON catalog of tender groups.
//!
//! Every mutation is a read-modify-write round trip: the cached copy is
//! mutated in place, written back, then re-downloaded. With
//! `IndexWriteMode::Overwrite` two writers working from the same base
//! version silently lose one of the updates. `IndexWriteMode::Conditional`
//! writes only if the stored etag still matches and re-applies the mutation
//! on top of a fresh copy when it does not.

use crate::{
    config::IndexWriteMode,
    errors::{IndexError, IndexResult, StorageError},
    models::{
        index::{GroupRecord, INDEX_KEY, IndexDocument},
        object::{UploadOptions, UploadReceipt},
    },
    services::storage_client::{ObjectStorageClient, WriteCondition},
};
use bytes::Bytes;
use serde_json::Value;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

const MAX_CONFLICT_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone)]
struct CachedIndex {
    doc: IndexDocument,
    /// Version of the stored object `doc` was derived from.
    e_tag: Option<String>,
    version: Option<String>,
}

#[derive(Debug)]
pub struct MetadataIndex {
    client: ObjectStorageClient,
    mode: IndexWriteMode,
    cache: Mutex<Option<CachedIndex>>,
}

impl MetadataIndex {
    /// Wrap `client` without touching the bucket yet.
    pub fn new(client: ObjectStorageClient, mode: IndexWriteMode) -> Self {
        Self {
            client,
            mode,
            cache: Mutex::new(None),
        }
    }

    /// Wrap `client` and load (or create) the index document right away.
    pub async fn open(client: ObjectStorageClient, mode: IndexWriteMode) -> IndexResult<Self> {
        let index = Self::new(client, mode);
        index.ensure_loaded().await?;
        Ok(index)
    }

    pub fn client(&self) -> &ObjectStorageClient {
        &self.client
    }

    pub fn mode(&self) -> IndexWriteMode {
        self.mode
    }

    fn lock_cache(&self) -> MutexGuard<'_, Option<CachedIndex>> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Last document seen by this instance. May be stale.
    pub fn cached(&self) -> Option<IndexDocument> {
        self.lock_cache().as_ref().map(|c| c.doc.clone())
    }

    /// Download and parse the index, creating an empty one if it is absent.
    ///
    /// A stored document that does not parse is reported as `Corrupt` and
    /// left untouched.
    pub async fn ensure_loaded(&self) -> IndexResult<IndexDocument> {
        for _ in 0..2 {
            match self.client.fetch(INDEX_KEY).await {
                Ok(fetched) => {
                    let doc: IndexDocument =
                        serde_json::from_slice(&fetched.bytes).map_err(|e| IndexError::Corrupt {
                            key: INDEX_KEY.to_string(),
                            reason: e.to_string(),
                        })?;
                    debug!(
                        "Loaded index with {} groups (etag {:?})",
                        doc.groups.len(),
                        fetched.info.e_tag
                    );
                    *self.lock_cache() = Some(CachedIndex {
                        doc: doc.clone(),
                        e_tag: fetched.info.e_tag,
                        version: fetched.info.version,
                    });
                    return Ok(doc);
                }
                Err(err) if err.is_not_found() => {
                    let doc = IndexDocument::empty(self.client.bucket());
                    let condition = match self.mode {
                        IndexWriteMode::Overwrite => WriteCondition::Overwrite,
                        IndexWriteMode::Conditional => WriteCondition::Create,
                    };
                    match self.write(&doc, condition).await {
                        Ok(receipt) => {
                            info!("Created empty index `{}` in bucket `{}`", INDEX_KEY, doc.bucket);
                            *self.lock_cache() = Some(CachedIndex {
                                doc: doc.clone(),
                                e_tag: receipt.e_tag,
                                version: None,
                            });
                            return Ok(doc);
                        }
                        // another writer created it first; read theirs
                        Err(IndexError::Storage(StorageError::PreconditionFailed { .. })) => continue,
                        Err(err) => return Err(err),
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(IndexError::Conflict { attempts: 2 })
    }

    /// Re-download the index, replacing the cached copy.
    pub async fn refresh(&self) -> IndexResult<IndexDocument> {
        self.ensure_loaded().await
    }

    /// Write `doc` as the index.
    ///
    /// In overwrite mode this is unconditional. In conditional mode it only
    /// succeeds if the stored index is still the version last seen here,
    /// otherwise `Conflict` is returned.
    pub async fn save(&self, doc: &IndexDocument) -> IndexResult<()> {
        let condition = self.save_condition();
        match self.write(doc, condition).await {
            Ok(receipt) => {
                *self.lock_cache() = Some(CachedIndex {
                    doc: doc.clone(),
                    e_tag: receipt.e_tag,
                    version: None,
                });
                info!("Saved index with {} groups", doc.groups.len());
                Ok(())
            }
            Err(IndexError::Storage(StorageError::PreconditionFailed { .. })) => {
                Err(IndexError::Conflict { attempts: 1 })
            }
            Err(err) => Err(err),
        }
    }

    fn save_condition(&self) -> WriteCondition {
        match self.mode {
            IndexWriteMode::Overwrite => WriteCondition::Overwrite,
            IndexWriteMode::Conditional => match self.lock_cache().as_ref() {
                Some(cached) if cached.e_tag.is_some() || cached.version.is_some() => {
                    WriteCondition::Match {
                        e_tag: cached.e_tag.clone(),
                        version: cached.version.clone(),
                    }
                }
                _ => WriteCondition::Create,
            },
        }
    }

    async fn write(
        &self,
        doc: &IndexDocument,
        condition: WriteCondition,
    ) -> IndexResult<UploadReceipt> {
        let body = serde_json::to_vec_pretty(doc)?;
        let options = UploadOptions {
            content_type: Some("application/json".into()),
            ..Default::default()
        };
        let receipt = self
            .client
            .put_bytes(INDEX_KEY, Bytes::from(body), &options, condition)
            .await?;
        Ok(receipt)
    }

    /// Apply `change` to the cached index and persist it.
    ///
    /// `change` returns whether it modified the document; unchanged documents
    /// are not written. In conditional mode a lost race reloads the index and
    /// applies `change` again.
    async fn mutate<F>(&self, mut change: F) -> IndexResult<bool>
    where
        F: FnMut(&mut IndexDocument) -> IndexResult<bool>,
    {
        if self.cached().is_none() {
            self.ensure_loaded().await?;
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            let snapshot = {
                let mut guard = self.lock_cache();
                let cached = match guard.as_mut() {
                    Some(cached) => cached,
                    None => return Err(IndexError::Conflict { attempts }),
                };
                if !change(&mut cached.doc)? {
                    return Ok(false);
                }
                cached.doc.touch();
                cached.doc.clone()
            };

            match self.save(&snapshot).await {
                Ok(()) => {
                    // the write landed; `save` already cached what was written
                    if let Err(err) = self.ensure_loaded().await {
                        warn!("Index saved but re-reading it failed: {}", err);
                    }
                    return Ok(true);
                }
                Err(IndexError::Conflict { .. }) if attempts < MAX_CONFLICT_ATTEMPTS => {
                    warn!(
                        "Index changed underneath us (attempt {}), reloading and re-applying",
                        attempts
                    );
                    self.ensure_loaded().await?;
                }
                Err(IndexError::Conflict { .. }) => {
                    *self.lock_cache() = None;
                    return Err(IndexError::Conflict { attempts });
                }
                Err(err) => {
                    // the cache holds an unsaved change now
                    *self.lock_cache() = None;
                    return Err(err);
                }
            }
        }
    }

    /// Add `group_id` if it is not already present. Returns whether it was added.
    pub async fn register_group(&self, group_id: &str, record: GroupRecord) -> IndexResult<bool> {
        let added = self
            .mutate(|doc| {
                if doc.contains(group_id) {
                    return Ok(false);
                }
                doc.groups.insert(group_id.to_string(), record.clone());
                Ok(true)
            })
            .await?;
        if added {
            info!("Registered group `{}`", group_id);
        } else {
            debug!("Group `{}` already registered", group_id);
        }
        Ok(added)
    }

    pub async fn mark_documents_uploaded(&self, group_id: &str) -> IndexResult<()> {
        self.mutate(|doc| {
            let record = doc
                .groups
                .get_mut(group_id)
                .ok_or_else(|| IndexError::UnknownGroup(group_id.to_string()))?;
            let changed = !record.documents;
            record.documents = true;
            Ok(changed)
        })
        .await?;
        Ok(())
    }

    pub async fn mark_publication(&self, group_id: &str, publication: bool) -> IndexResult<()> {
        self.mutate(|doc| {
            let record = doc
                .groups
                .get_mut(group_id)
                .ok_or_else(|| IndexError::UnknownGroup(group_id.to_string()))?;
            let changed = record.publication != publication;
            record.publication = publication;
            Ok(changed)
        })
        .await?;
        Ok(())
    }

    pub async fn set_group_data(&self, group_id: &str, data: Value) -> IndexResult<()> {
        self.mutate(|doc| {
            let record = doc
                .groups
                .get_mut(group_id)
                .ok_or_else(|| IndexError::UnknownGroup(group_id.to_string()))?;
            let changed = record.data != data;
            record.data = data.clone();
            Ok(changed)
        })
        .await?;
        Ok(())
    }

    /// Record for `group_id` from the cached copy, loading it if needed.
    pub async fn group(&self, group_id: &str) -> IndexResult<Option<GroupRecord>> {
        let doc = match self.cached() {
            Some(doc) => doc,
            None => self.ensure_loaded().await?,
        };
        Ok(doc.groups.get(group_id).cloned())
    }

    pub async fn group_ids(&self) -> IndexResult<Vec<String>> {
        let doc = match self.cached() {
            Some(doc) => doc,
            None => self.ensure_loaded().await?,
        };
        Ok(doc.groups.keys().cloned().collect())
    }
}
