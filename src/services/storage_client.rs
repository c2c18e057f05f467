//! src/services/storage_client.rs
//!
//! ObjectStorageClient: retrying CRUD over one bucket of an S3-compatible
//! store. The remote session is an `object_store` handle that can be rebuilt
//! with `reconnect()`; every data operation goes through `RetryPolicy` and
//! sizes its transfer with `TransferPlanner`.

use crate::{
    config::StorageConfig,
    errors::{StorageError, StorageResult},
    models::{
        object::{
            BatchUploadReport, DownloadReceipt, DownloadTarget, ObjectInfo, ProgressCallback,
            UploadOptions, UploadOutcome, UploadReceipt, UploadSource,
        },
        transfer::TransferPlan,
    },
    services::{
        content_type,
        retry::{CallScope, RetryPolicy},
        transfer_planner::TransferPlanner,
    },
};
use bytes::{Bytes, BytesMut};
use futures::{
    StreamExt, pin_mut,
    stream::{self, FuturesUnordered},
};
use md5::Context;
use object_store::{
    Attribute, Attributes, ClientOptions, MultipartUpload, ObjectStore, PutMode,
    PutMultipartOpts, PutOptions, PutPayload, PutResult, RetryConfig, UpdateVersion, UploadPart,
    aws::{AmazonS3Builder, S3ConditionalPut},
    path::Path as ObjectPath,
};
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{
        Arc, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant as StdInstant,
};
use tokio::{
    fs::{self, File},
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    time::Instant,
};
use tokio_util::{io::ReaderStream, sync::CancellationToken};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Builds a fresh remote session. Called at construction and on `reconnect()`.
pub type StoreFactory = Arc<dyn Fn() -> StorageResult<Arc<dyn ObjectStore>> + Send + Sync>;

const READ_BUFFER_SIZE: usize = 1024 * 1024;
const MAX_OBJECT_KEY_LEN: usize = 1024;
const DEFAULT_LIST_PAGE_SIZE: usize = 1000;

/// Precondition attached to a write.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum WriteCondition {
    /// Last writer wins.
    #[default]
    Overwrite,
    /// Fail if the key already exists.
    Create,
    /// Fail unless the stored object still carries this etag/version.
    Match {
        e_tag: Option<String>,
        version: Option<String>,
    },
}

impl From<WriteCondition> for PutMode {
    fn from(condition: WriteCondition) -> Self {
        match condition {
            WriteCondition::Overwrite => PutMode::Overwrite,
            WriteCondition::Create => PutMode::Create,
            WriteCondition::Match { e_tag, version } => {
                PutMode::Update(UpdateVersion { e_tag, version })
            }
        }
    }
}

/// Options for `put_objects`.
#[derive(Debug, Clone, Default)]
pub struct BatchUploadOptions {
    /// Destination keys become `{key_prefix}/{basename}`.
    pub key_prefix: Option<String>,
    /// User metadata applied to every file.
    pub metadata: HashMap<String, String>,
    /// Explicit content types per source; others are inferred.
    pub content_types: HashMap<PathBuf, String>,
}

/// Object bytes together with the metadata of the version that was read.
#[derive(Debug, Clone)]
pub struct FetchedObject {
    pub bytes: Bytes,
    pub info: ObjectInfo,
}

/// Result of one step of `health_check`.
#[derive(Debug, Clone, Serialize)]
pub struct CheckOutcome {
    pub ok: bool,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub ok: bool,
    pub latency_ms: u128,
    pub checks: BTreeMap<&'static str, CheckOutcome>,
}

struct Session {
    store: Arc<dyn ObjectStore>,
    generation: u64,
}

struct ClientInner {
    bucket: String,
    factory: StoreFactory,
    /// Exclusive (write) access is taken only by `reconnect()`.
    session: RwLock<Session>,
    reconnects: AtomicU64,
}

/// Cheap to clone; clones share the remote session.
#[derive(Clone)]
pub struct ObjectStorageClient {
    inner: Arc<ClientInner>,
    retry: RetryPolicy,
    planner: TransferPlanner,
    list_page_size: usize,
    scope: CallScope,
}

impl std::fmt::Debug for ObjectStorageClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStorageClient")
            .field("bucket", &self.inner.bucket)
            .field("retry", &self.retry)
            .field("planner", &self.planner)
            .field("list_page_size", &self.list_page_size)
            .finish()
    }
}

impl ObjectStorageClient {
    /// Connect to the S3-compatible endpoint described by `cfg`.
    pub fn new(cfg: &StorageConfig) -> StorageResult<Self> {
        let s3_cfg = cfg.clone();
        let factory: StoreFactory = Arc::new(move || build_s3_store(&s3_cfg));
        let client = Self::with_factory(cfg.bucket.clone(), factory)?
            .with_retry_policy(RetryPolicy::new(cfg.max_retries, cfg.backoff_factor))
            .with_list_page_size(cfg.list_page_size);
        info!(
            "Created storage client for bucket `{}` (endpoint: {})",
            cfg.bucket,
            cfg.endpoint.as_deref().unwrap_or("aws default")
        );
        Ok(client)
    }

    /// Wrap an existing store. `reconnect()` hands back the same store.
    pub fn with_store(bucket: impl Into<String>, store: Arc<dyn ObjectStore>) -> StorageResult<Self> {
        let factory: StoreFactory = Arc::new(move || Ok(store.clone()));
        Self::with_factory(bucket, factory)
    }

    pub fn with_factory(bucket: impl Into<String>, factory: StoreFactory) -> StorageResult<Self> {
        let bucket = bucket.into();
        if bucket.trim().is_empty() {
            return Err(StorageError::Configuration("bucket name is empty".into()));
        }
        let store = factory()?;
        Ok(Self {
            inner: Arc::new(ClientInner {
                bucket,
                factory,
                session: RwLock::new(Session {
                    store,
                    generation: 0,
                }),
                reconnects: AtomicU64::new(0),
            }),
            retry: RetryPolicy::default(),
            planner: TransferPlanner::default(),
            list_page_size: DEFAULT_LIST_PAGE_SIZE,
            scope: CallScope::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_planner(mut self, planner: TransferPlanner) -> Self {
        self.planner = planner;
        self
    }

    pub fn with_list_page_size(mut self, page_size: usize) -> Self {
        self.list_page_size = page_size.max(1);
        self
    }

    /// A handle whose operations stop with `Cancelled` once `token` fires.
    pub fn with_cancellation(&self, token: CancellationToken) -> Self {
        let mut scoped = self.clone();
        scoped.scope.token = Some(token);
        scoped
    }

    /// A handle whose operations stop with `DeadlineExceeded` at `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let mut scoped = self.clone();
        scoped.scope.deadline = Some(deadline);
        scoped
    }

    pub fn bucket(&self) -> &str {
        &self.inner.bucket
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn plan_for(&self, size: Option<u64>) -> TransferPlan {
        self.planner.plan(size)
    }

    pub fn reconnect_count(&self) -> u64 {
        self.inner.reconnects.load(Ordering::SeqCst)
    }

    fn store(&self) -> Arc<dyn ObjectStore> {
        let session = self
            .inner
            .session
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        session.store.clone()
    }

    /// Tear down the current session and build a new one.
    ///
    /// Calls already in flight finish on the old session; new calls use the
    /// new one. Never triggered automatically.
    pub fn reconnect(&self) -> StorageResult<()> {
        let mut session = self
            .inner
            .session
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let store = (self.inner.factory)()?;
        session.store = store;
        session.generation += 1;
        self.inner.reconnects.fetch_add(1, Ordering::SeqCst);
        info!(
            "Reconnected storage session for bucket `{}` (generation {})",
            self.inner.bucket, session.generation
        );
        Ok(())
    }

    /// Upload `source` to `key`, overwriting whatever is there.
    pub async fn put_object(
        &self,
        source: UploadSource,
        key: &str,
        options: &UploadOptions,
    ) -> StorageResult<UploadReceipt> {
        let location = object_path(key)?;
        let content_type = options
            .content_type
            .clone()
            .unwrap_or_else(|| content_type::detect(source.file_name().unwrap_or(key)).to_string());
        let attributes = build_attributes(&content_type, &options.metadata);

        let receipt = match source {
            UploadSource::Path(file_path) => {
                let size = fs::metadata(&file_path).await?.len();
                let plan = self.planner.plan(Some(size));
                if plan.use_multipart {
                    self.retry
                        .run(&self.scope, "put_object", || async {
                            let file = File::open(&file_path).await?;
                            self.put_multipart(&location, key, file, None, plan, &attributes)
                                .await
                        })
                        .await?
                } else {
                    let data = Bytes::from(fs::read(&file_path).await?);
                    self.put_single_retried(&location, key, data, &attributes, WriteCondition::Overwrite)
                        .await?
                }
            }
            UploadSource::Bytes(data) => {
                let plan = self.planner.plan(Some(data.len() as u64));
                if plan.use_multipart {
                    self.retry
                        .run(&self.scope, "put_object", || {
                            let reader = std::io::Cursor::new(data.clone());
                            self.put_multipart(&location, key, reader, None, plan, &attributes)
                        })
                        .await?
                } else {
                    self.put_single_retried(&location, key, data, &attributes, WriteCondition::Overwrite)
                        .await?
                }
            }
            UploadSource::Reader(mut reader) => {
                let plan = self.planner.plan(None);
                let mut head = Vec::new();
                (&mut reader)
                    .take(self.planner.multipart_threshold() + 1)
                    .read_to_end(&mut head)
                    .await?;
                if head.len() as u64 <= self.planner.multipart_threshold() {
                    self.put_single_retried(&location, key, Bytes::from(head), &attributes, WriteCondition::Overwrite)
                        .await?
                } else {
                    warn!(
                        "stream for `{}` exceeded {} bytes, switching to multipart without retry",
                        key, self.planner.multipart_threshold()
                    );
                    let plan = TransferPlan {
                        use_multipart: true,
                        ..plan
                    };
                    self.scope
                        .guard(self.put_multipart(
                            &location,
                            key,
                            reader,
                            Some(Bytes::from(head)),
                            plan,
                            &attributes,
                        ))
                        .await?
                }
            }
        };

        info!(
            "Uploaded `{}` ({} bytes, {}, multipart: {})",
            receipt.key, receipt.size, content_type, receipt.multipart
        );
        Ok(UploadReceipt {
            content_type,
            ..receipt
        })
    }

    /// Upload in-memory bytes under a write precondition.
    pub async fn put_bytes(
        &self,
        key: &str,
        data: Bytes,
        options: &UploadOptions,
        condition: WriteCondition,
    ) -> StorageResult<UploadReceipt> {
        let location = object_path(key)?;
        let content_type = options
            .content_type
            .clone()
            .unwrap_or_else(|| content_type::detect(key).to_string());
        let attributes = build_attributes(&content_type, &options.metadata);
        let receipt = self
            .put_single_retried(&location, key, data, &attributes, condition)
            .await?;
        debug!("Wrote `{}` ({} bytes)", key, receipt.size);
        Ok(UploadReceipt {
            content_type,
            ..receipt
        })
    }

    async fn put_single_retried(
        &self,
        location: &ObjectPath,
        key: &str,
        data: Bytes,
        attributes: &Attributes,
        condition: WriteCondition,
    ) -> StorageResult<UploadReceipt> {
        let mut digest = Context::new();
        digest.consume(&data);
        let md5 = format!("{:x}", digest.compute());
        let size = data.len() as u64;

        let result: PutResult = self
            .retry
            .run(&self.scope, "put_object", || {
                let opts = PutOptions {
                    mode: condition.clone().into(),
                    attributes: attributes.clone(),
                    ..Default::default()
                };
                let payload = PutPayload::from_bytes(data.clone());
                async move {
                    debug!("PUT {} ({} bytes)", location, size);
                    self.store()
                        .put_opts(location, payload, opts)
                        .await
                        .map_err(|e| StorageError::remote("put_object", key, e))
                }
            })
            .await?;

        Ok(UploadReceipt {
            key: key.to_string(),
            size,
            content_type: String::new(),
            e_tag: result.e_tag,
            md5,
            multipart: false,
        })
    }

    /// Stream `reader` (after an optional already-read `prefix`) as a
    /// multipart upload with at most `plan.max_concurrency` parts in flight.
    ///
    /// Any failure once the upload exists, completion included, aborts it so
    /// no orphaned parts stay behind in the bucket.
    async fn put_multipart<R>(
        &self,
        location: &ObjectPath,
        key: &str,
        reader: R,
        prefix: Option<Bytes>,
        plan: TransferPlan,
        attributes: &Attributes,
    ) -> StorageResult<UploadReceipt>
    where
        R: AsyncRead + Unpin,
    {
        let store = self.store();
        let opts = PutMultipartOpts {
            attributes: attributes.clone(),
            ..Default::default()
        };
        let mut upload = store
            .put_multipart_opts(location, opts)
            .await
            .map_err(|e| StorageError::remote("put_object", key, e))?;

        let sent = match send_parts(upload.as_mut(), key, reader, prefix, plan).await {
            Ok(sent) => sent,
            Err(err) => {
                if let Err(abort_err) = upload.abort().await {
                    warn!("aborting multipart upload of `{}` failed: {}", key, abort_err);
                }
                return Err(err);
            }
        };
        debug!(
            "multipart PUT {} complete: {} bytes in {} parts",
            location, sent.size, sent.parts
        );

        Ok(UploadReceipt {
            key: key.to_string(),
            size: sent.size,
            content_type: String::new(),
            e_tag: sent.result.e_tag,
            md5: sent.md5,
            multipart: true,
        })
    }

    /// Upload several local files, continuing past failures.
    ///
    /// Keys are `{key_prefix}/{basename}` or just `{basename}`. Each file
    /// carries its own retry; the batch as a whole is not retried.
    pub async fn put_objects(
        &self,
        sources: &[PathBuf],
        options: &BatchUploadOptions,
    ) -> BatchUploadReport {
        let mut report = BatchUploadReport::default();
        for source in sources {
            let key = match batch_key(source, options.key_prefix.as_deref()) {
                Ok(key) => key,
                Err(err) => {
                    warn!("skipping {}: {}", source.display(), err);
                    report.outcomes.push(UploadOutcome {
                        source: source.clone(),
                        key: String::new(),
                        result: Err(err),
                    });
                    continue;
                }
            };
            let file_options = UploadOptions {
                metadata: options.metadata.clone(),
                content_type: options.content_types.get(source).cloned(),
            };
            let result = self
                .put_object(UploadSource::Path(source.clone()), &key, &file_options)
                .await;
            if let Err(err) = &result {
                warn!("upload of {} to `{}` failed: {}", source.display(), key, err);
            }
            report.outcomes.push(UploadOutcome {
                source: source.clone(),
                key,
                result,
            });
        }
        info!(
            "Batch upload finished: {}/{} succeeded",
            report.succeeded(),
            report.total()
        );
        report
    }

    /// Download `key` into `target`.
    ///
    /// File targets: parent directories are created, absence is reported as
    /// `NotFound` without touching the destination, and the bytes land in a
    /// sibling temp file that is renamed into place only on success.
    pub async fn get_object(
        &self,
        key: &str,
        target: DownloadTarget<'_>,
        progress: Option<ProgressCallback>,
    ) -> StorageResult<DownloadReceipt> {
        let location = object_path(key)?;
        match target {
            DownloadTarget::Path(dest) => {
                self.download_to_file(&location, key, &dest, progress).await
            }
            DownloadTarget::Writer(writer) => {
                let fetched = self.fetch(key).await?;
                writer.write_all(&fetched.bytes).await?;
                writer.flush().await?;
                let size = fetched.bytes.len() as u64;
                if let Some(progress) = &progress {
                    progress(size);
                }
                let mut digest = Context::new();
                digest.consume(&fetched.bytes);
                Ok(DownloadReceipt {
                    key: key.to_string(),
                    size,
                    md5: format!("{:x}", digest.compute()),
                    multipart: false,
                })
            }
        }
    }

    async fn download_to_file(
        &self,
        location: &ObjectPath,
        key: &str,
        dest: &Path,
        progress: Option<ProgressCallback>,
    ) -> StorageResult<DownloadReceipt> {
        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let size = match self.head_object(key).await {
            Ok(Some(info)) => Some(info.size),
            Ok(None) => {
                return Err(StorageError::NotFound {
                    key: key.to_string(),
                });
            }
            Err(err) => {
                warn!("size lookup for `{}` failed, using default plan: {}", key, err);
                None
            }
        };
        let plan = self.planner.plan(size);

        let file_name = dest
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("download");
        let tmp_path = dest.with_file_name(format!(".{}.tmp-{}", file_name, Uuid::new_v4()));

        let result = self
            .retry
            .run(&self.scope, "get_object", || {
                self.download_once(location, key, &tmp_path, plan, size, progress.clone())
            })
            .await;

        let (written, md5) = match result {
            Ok(done) => done,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err);
            }
        };

        if let Err(err) = fs::rename(&tmp_path, dest).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(dest).await?;
                fs::rename(&tmp_path, dest).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        }

        info!(
            "Downloaded `{}` to {} ({} bytes, multipart: {})",
            key,
            dest.display(),
            written,
            plan.use_multipart
        );
        Ok(DownloadReceipt {
            key: key.to_string(),
            size: written,
            md5,
            multipart: plan.use_multipart && size.is_some(),
        })
    }

    /// One download attempt into `tmp_path`, truncating it first.
    async fn download_once(
        &self,
        location: &ObjectPath,
        key: &str,
        tmp_path: &Path,
        plan: TransferPlan,
        size: Option<u64>,
        progress: Option<ProgressCallback>,
    ) -> StorageResult<(u64, String)> {
        let store = self.store();
        let mut file = File::create(tmp_path).await?;
        let mut digest = Context::new();
        let mut written: u64 = 0;

        match size.filter(|_| plan.use_multipart) {
            Some(total) => {
                let ranges: Vec<_> = (0..total)
                    .step_by(plan.chunk_size as usize)
                    .map(|start| start..(start + plan.chunk_size).min(total))
                    .collect();
                debug!("ranged GET {} in {} parts", location, ranges.len());
                let parts = stream::iter(ranges)
                    .map(|range| {
                        let store = store.clone();
                        async move { store.get_range(location, range).await }
                    })
                    .buffered(plan.max_concurrency);
                pin_mut!(parts);
                while let Some(part) = parts.next().await {
                    let bytes = part.map_err(|e| StorageError::remote("get_object", key, e))?;
                    file.write_all(&bytes).await?;
                    digest.consume(&bytes);
                    written += bytes.len() as u64;
                    if let Some(progress) = &progress {
                        progress(written);
                    }
                }
            }
            None => {
                debug!("GET {}", location);
                let result = store
                    .get(location)
                    .await
                    .map_err(|e| StorageError::remote("get_object", key, e))?;
                let body = result.into_stream();
                pin_mut!(body);
                while let Some(chunk) = body.next().await {
                    let bytes = chunk.map_err(|e| StorageError::remote("get_object", key, e))?;
                    file.write_all(&bytes).await?;
                    digest.consume(&bytes);
                    written += bytes.len() as u64;
                    if let Some(progress) = &progress {
                        progress(written);
                    }
                }
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok((written, format!("{:x}", digest.compute())))
    }

    /// Fetch an object fully into memory, retried.
    pub async fn fetch(&self, key: &str) -> StorageResult<FetchedObject> {
        let location = object_path(key)?;
        self.retry
            .run(&self.scope, "get_object", || async {
                debug!("GET {}", location);
                let result = self
                    .store()
                    .get(&location)
                    .await
                    .map_err(|e| StorageError::remote("get_object", key, e))?;
                let info = ObjectInfo::from(result.meta.clone());
                let bytes = result
                    .bytes()
                    .await
                    .map_err(|e| StorageError::remote("get_object", key, e))?;
                Ok(FetchedObject { bytes, info })
            })
            .await
    }

    pub async fn get_bytes(&self, key: &str) -> StorageResult<Bytes> {
        Ok(self.fetch(key).await?.bytes)
    }

    /// List keys starting with `prefix` (plain string match, as S3 does).
    ///
    /// Only the first page (`list_page_size` keys) is returned. When listing
    /// fails and `prefix` looks like a full object key that exists, that key
    /// alone is returned.
    pub async fn list_objects(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let prefix = prefix.trim_start_matches('/');
        let listed = self
            .retry
            .run(&self.scope, "list_objects", || self.list_page(prefix))
            .await;

        match listed {
            Ok(keys) => {
                debug!("LIST `{}` returned {} keys", prefix, keys.len());
                Ok(keys)
            }
            Err(err) if !prefix.is_empty() && !prefix.ends_with('/') => {
                if self.exists(prefix).await {
                    warn!(
                        "listing `{}` failed ({}), falling back to the exact key",
                        prefix, err
                    );
                    Ok(vec![prefix.to_string()])
                } else {
                    Err(err)
                }
            }
            Err(err) => Err(err),
        }
    }

    /// One page of keys starting with `prefix`.
    ///
    /// Listing starts at the prefix (`list_with_offset`) inside its parent
    /// segment and stops at the first key past the prefix range, so
    /// unrelated keys in the bucket are not walked. Keys come back in
    /// lexicographic order, as S3 lists them.
    async fn list_page(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let parent = match prefix.rfind('/') {
            Some(idx) if idx > 0 => Some(object_path(&prefix[..idx])?),
            _ => None,
        };
        let store = self.store();
        let listing = match list_offset(prefix) {
            Some(offset) => store.list_with_offset(parent.as_ref(), &offset),
            None => store.list(parent.as_ref()),
        };
        pin_mut!(listing);

        let mut keys = Vec::new();
        while let Some(item) = listing.next().await {
            let meta = item.map_err(|e| StorageError::remote("list_objects", prefix, e))?;
            let key = meta.location.to_string();
            if key.starts_with(prefix) {
                keys.push(key);
                if keys.len() >= self.list_page_size {
                    break;
                }
            } else if key.as_str() > prefix {
                break;
            }
        }
        Ok(keys)
    }

    /// Delete `key`. Deleting a missing key succeeds.
    pub async fn delete_object(&self, key: &str) -> StorageResult<()> {
        let location = object_path(key)?;
        let result = self
            .retry
            .run(&self.scope, "delete_object", || async {
                debug!("DELETE {}", location);
                self.store()
                    .delete(&location)
                    .await
                    .map_err(|e| StorageError::remote("delete_object", key, e))
            })
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => {
                debug!("`{}` already absent", key);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// HEAD request: `Ok(None)` when absent, `Err` when the request failed.
    pub async fn head_object(&self, key: &str) -> StorageResult<Option<ObjectInfo>> {
        let location = object_path(key)?;
        let result = self
            .retry
            .run(&self.scope, "head_object", || async {
                debug!("HEAD {}", location);
                self.store()
                    .head(&location)
                    .await
                    .map_err(|e| StorageError::remote("head_object", key, e))
            })
            .await;
        match result {
            Ok(meta) => Ok(Some(ObjectInfo::from(meta))),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// `true` only when HEAD positively found the key. HEAD errors are
    /// reported as `false`; use `head_object` to tell them apart.
    pub async fn exists(&self, key: &str) -> bool {
        match self.head_object(key).await {
            Ok(found) => found.is_some(),
            Err(err) => {
                debug!("existence check for `{}` failed: {}", key, err);
                false
            }
        }
    }

    /// Write, read back and delete a throwaway object.
    pub async fn health_check(&self) -> HealthReport {
        let started = StdInstant::now();
        let key = format!(".healthcheck-{}", Uuid::new_v4());
        let payload = Bytes::from_static(b"healthcheck");
        let mut checks = BTreeMap::new();

        let write = self
            .put_bytes(&key, payload.clone(), &UploadOptions::default(), WriteCondition::Overwrite)
            .await;
        checks.insert("write", outcome(write.as_ref().map(|_| ())));

        if write.is_ok() {
            let read = match self.get_bytes(&key).await {
                Ok(bytes) if bytes == payload => Ok(()),
                Ok(bytes) => Err(format!("read back {} unexpected bytes", bytes.len())),
                Err(err) => Err(err.to_string()),
            };
            checks.insert(
                "read",
                CheckOutcome {
                    ok: read.is_ok(),
                    detail: read.err(),
                },
            );
            checks.insert(
                "delete",
                outcome(self.delete_object(&key).await.as_ref().map(|_| ())),
            );
        }

        HealthReport {
            ok: checks.len() == 3 && checks.values().all(|c| c.ok),
            latency_ms: started.elapsed().as_millis(),
            checks,
        }
    }
}

fn outcome<E: std::fmt::Display>(result: Result<(), &E>) -> CheckOutcome {
    match result {
        Ok(()) => CheckOutcome {
            ok: true,
            detail: None,
        },
        Err(err) => CheckOutcome {
            ok: false,
            detail: Some(err.to_string()),
        },
    }
}

fn build_s3_store(cfg: &StorageConfig) -> StorageResult<Arc<dyn ObjectStore>> {
    let client_options = ClientOptions::new()
        .with_connect_timeout(cfg.connect_timeout)
        .with_timeout(cfg.read_timeout)
        .with_pool_max_idle_per_host(cfg.pool_size)
        .with_allow_http(cfg.allow_http);

    let mut builder = AmazonS3Builder::new()
        .with_bucket_name(&cfg.bucket)
        .with_region(&cfg.region)
        .with_virtual_hosted_style_request(false)
        .with_conditional_put(S3ConditionalPut::ETagMatch)
        .with_client_options(client_options)
        // RetryPolicy owns retries; the SDK makes exactly one attempt
        .with_retry(RetryConfig {
            max_retries: 0,
            ..Default::default()
        });

    if let Some(endpoint) = &cfg.endpoint {
        builder = builder.with_endpoint(endpoint);
    }
    if let (Some(access_key), Some(secret_key)) = (&cfg.access_key_id, &cfg.secret_access_key) {
        builder = builder
            .with_access_key_id(access_key)
            .with_secret_access_key(secret_key);
    }

    let store = builder.build().map_err(|e| {
        StorageError::Configuration(format!(
            "building S3 client for bucket `{}`: {}",
            cfg.bucket, e
        ))
    })?;
    Ok(Arc::new(store))
}

fn build_attributes(content_type: &str, metadata: &HashMap<String, String>) -> Attributes {
    let mut attributes = Attributes::new();
    attributes.insert(Attribute::ContentType, content_type.to_string().into());
    for (name, value) in metadata {
        attributes.insert(Attribute::Metadata(name.clone().into()), value.clone().into());
    }
    attributes
}

struct SentParts {
    size: u64,
    parts: u64,
    md5: String,
    result: PutResult,
}

/// Cut the stream into `plan.chunk_size` parts, upload them and complete.
async fn send_parts<R>(
    upload: &mut dyn MultipartUpload,
    key: &str,
    reader: R,
    prefix: Option<Bytes>,
    plan: TransferPlan,
) -> StorageResult<SentParts>
where
    R: AsyncRead + Unpin,
{
    let chunk_size = plan.chunk_size.max(1) as usize;
    let max_in_flight = plan.max_concurrency.max(1);
    let mut buffer = BytesMut::with_capacity(chunk_size);
    let mut in_flight: FuturesUnordered<UploadPart> = FuturesUnordered::new();
    let mut digest = Context::new();
    let mut size: u64 = 0;
    let mut parts: u64 = 0;

    let head = stream::iter(prefix.map(Ok::<Bytes, std::io::Error>));
    let chunks = head.chain(ReaderStream::with_capacity(reader, READ_BUFFER_SIZE));
    pin_mut!(chunks);
    loop {
        let chunk = chunks.next().await.transpose()?;
        let done = chunk.is_none();
        if let Some(chunk) = chunk {
            digest.consume(&chunk);
            size += chunk.len() as u64;
            buffer.extend_from_slice(&chunk);
        }

        while buffer.len() >= chunk_size || (done && !buffer.is_empty()) {
            let part = buffer.split_to(chunk_size.min(buffer.len())).freeze();
            while in_flight.len() >= max_in_flight {
                if let Some(res) = in_flight.next().await {
                    res.map_err(|e| StorageError::remote("put_object", key, e))?;
                }
            }
            in_flight.push(upload.put_part(PutPayload::from(part)));
            parts += 1;
        }
        if done {
            break;
        }
    }

    while let Some(res) = in_flight.next().await {
        res.map_err(|e| StorageError::remote("put_object", key, e))?;
    }
    let result = upload
        .complete()
        .await
        .map_err(|e| StorageError::remote("put_object", key, e))?;

    Ok(SentParts {
        size,
        parts,
        md5: format!("{:x}", digest.compute()),
        result,
    })
}

/// Exclusive listing offset sorting just before every key that starts with
/// `prefix`. `None` when the whole parent segment is wanted.
fn list_offset(prefix: &str) -> Option<ObjectPath> {
    if prefix.is_empty() || prefix.ends_with('/') {
        return None;
    }
    let last = prefix.chars().next_back()?;
    let before = prefix[..prefix.len() - last.len_utf8()].trim_end_matches('/');
    if before.is_empty() {
        return None;
    }
    ObjectPath::parse(before).ok()
}

/// Validate a bucket-relative key and turn it into a store path.
///
/// Rejects empty keys, `..` segments, empty segments and control bytes.
/// A single leading `/` is tolerated.
pub(crate) fn object_path(key: &str) -> StorageResult<ObjectPath> {
    let invalid = |reason: &str| StorageError::InvalidKey {
        key: key.to_string(),
        reason: reason.to_string(),
    };
    let trimmed = key.strip_prefix('/').unwrap_or(key);
    if trimmed.is_empty() {
        return Err(invalid("key is empty"));
    }
    if trimmed.len() > MAX_OBJECT_KEY_LEN {
        return Err(invalid("key is longer than 1024 bytes"));
    }
    if trimmed.bytes().any(|b| b.is_ascii_control()) {
        return Err(invalid("key contains control characters"));
    }
    if trimmed.split('/').any(|segment| segment.is_empty()) {
        return Err(invalid("key contains an empty path segment"));
    }
    if trimmed.split('/').any(|segment| segment == ".." || segment == ".") {
        return Err(invalid("key contains a relative path segment"));
    }
    ObjectPath::parse(trimmed).map_err(|e| invalid(&e.to_string()))
}

fn batch_key(source: &Path, key_prefix: Option<&str>) -> StorageResult<String> {
    let basename = source
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| StorageError::InvalidKey {
            key: source.display().to_string(),
            reason: "source has no usable file name".into(),
        })?;
    Ok(match key_prefix.map(|p| p.trim_end_matches('/')) {
        Some(prefix) if !prefix.is_empty() => format!("{}/{}", prefix, basename),
        _ => basename.to_string(),
    })
}
