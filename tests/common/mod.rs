//! Shared fixtures: an in-memory bucket that can be told to fail.
#![allow(dead_code)]

use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use object_store::{
    GetOptions, GetResult, ListResult, MultipartUpload, ObjectMeta, ObjectStore, PutMultipartOpts,
    PutOptions, PutPayload, PutResult, Result, UploadPart,
    client::{HttpError, HttpErrorKind},
    memory::InMemory,
    path::Path,
};
use std::{
    collections::HashMap,
    fmt, io,
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tender_store::{ObjectStorageClient, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Put,
    /// GET and HEAD (HEAD is a GET with `head: true`).
    Get,
    List,
    Delete,
    /// One part of a multipart upload.
    Part,
    /// Completing a multipart upload.
    Complete,
    /// Aborting a multipart upload. Counted, never failed.
    Abort,
}

/// What an injected failure looks like on the wire.
#[derive(Debug, Clone)]
pub enum Fault {
    /// A non-2xx response, rendered the way the S3 client renders it.
    Status(u16),
    /// A transport-level timeout with no response.
    Timeout,
}

impl Fault {
    fn render(&self, op: Op, location: &str) -> object_store::Error {
        match self {
            Fault::Status(status) => {
                let method = match op {
                    Op::Get => "GET",
                    Op::List => "GET",
                    Op::Delete => "DELETE",
                    Op::Complete => "POST",
                    _ => "PUT",
                };
                object_store::Error::Generic {
                    store: "S3",
                    source: format!(
                        "Error performing {} https://s3.example.com/tenders/{} in 1.503ms - Server returned non-2xx status code: {} {}: <Error><Code>Injected</Code></Error>",
                        method,
                        location,
                        status,
                        reason(*status)
                    )
                    .into(),
                }
            }
            Fault::Timeout => object_store::Error::Generic {
                store: "S3",
                source: Box::new(HttpError::new(
                    HttpErrorKind::Timeout,
                    io::Error::new(io::ErrorKind::TimedOut, "operation timed out"),
                )),
            },
        }
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        400 => "Bad Request",
        403 => "Forbidden",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Error",
    }
}

#[derive(Debug, Default)]
struct Faults {
    remaining: HashMap<Op, (u32, Fault)>,
    calls: HashMap<Op, u32>,
}

impl Faults {
    fn enter(state: &Mutex<Faults>, op: Op, location: &str) -> Result<()> {
        let mut faults = state.lock().unwrap();
        *faults.calls.entry(op).or_default() += 1;
        match faults.remaining.get_mut(&op) {
            Some((times, fault)) if *times > 0 => {
                *times -= 1;
                Err(fault.render(op, location))
            }
            _ => Ok(()),
        }
    }
}

/// `InMemory` plus scripted failures and call counters.
#[derive(Debug)]
pub struct FlakyStore {
    inner: InMemory,
    faults: Arc<Mutex<Faults>>,
    listed: Arc<AtomicU64>,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: InMemory::new(),
            faults: Arc::new(Mutex::new(Faults::default())),
            listed: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Fail the next `times` calls of `op` with `fault`.
    pub fn fail_next(&self, op: Op, times: u32, fault: Fault) {
        self.faults
            .lock()
            .unwrap()
            .remaining
            .insert(op, (times, fault));
    }

    pub fn heal(&self) {
        self.faults.lock().unwrap().remaining.clear();
    }

    pub fn calls(&self, op: Op) -> u32 {
        self.faults
            .lock()
            .unwrap()
            .calls
            .get(&op)
            .copied()
            .unwrap_or(0)
    }

    pub fn reset_calls(&self) {
        self.faults.lock().unwrap().calls.clear();
        self.listed.store(0, Ordering::SeqCst);
    }

    /// Entries handed out by listing streams so far.
    pub fn listed_entries(&self) -> u64 {
        self.listed.load(Ordering::SeqCst)
    }

    fn counted(
        &self,
        stream: BoxStream<'static, Result<ObjectMeta>>,
    ) -> BoxStream<'static, Result<ObjectMeta>> {
        let listed = self.listed.clone();
        stream
            .inspect(move |_| {
                listed.fetch_add(1, Ordering::SeqCst);
            })
            .boxed()
    }
}

impl fmt::Display for FlakyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FlakyStore({})", self.inner)
    }
}

#[async_trait]
impl ObjectStore for FlakyStore {
    async fn put_opts(
        &self,
        location: &Path,
        payload: PutPayload,
        opts: PutOptions,
    ) -> Result<PutResult> {
        Faults::enter(&self.faults, Op::Put, location.as_ref())?;
        self.inner.put_opts(location, payload, opts).await
    }

    async fn put_multipart_opts(
        &self,
        location: &Path,
        opts: PutMultipartOpts,
    ) -> Result<Box<dyn MultipartUpload>> {
        Faults::enter(&self.faults, Op::Put, location.as_ref())?;
        let inner = self.inner.put_multipart_opts(location, opts).await?;
        Ok(Box::new(FlakyUpload {
            inner,
            location: location.to_string(),
            faults: self.faults.clone(),
        }))
    }

    async fn get_opts(&self, location: &Path, options: GetOptions) -> Result<GetResult> {
        Faults::enter(&self.faults, Op::Get, location.as_ref())?;
        self.inner.get_opts(location, options).await
    }

    async fn delete(&self, location: &Path) -> Result<()> {
        Faults::enter(&self.faults, Op::Delete, location.as_ref())?;
        self.inner.delete(location).await
    }

    fn list(&self, prefix: Option<&Path>) -> BoxStream<'static, Result<ObjectMeta>> {
        let at = prefix.map(|p| p.to_string()).unwrap_or_default();
        if let Err(err) = Faults::enter(&self.faults, Op::List, &at) {
            return futures::stream::once(async move { Err(err) }).boxed();
        }
        self.counted(self.inner.list(prefix))
    }

    fn list_with_offset(
        &self,
        prefix: Option<&Path>,
        offset: &Path,
    ) -> BoxStream<'static, Result<ObjectMeta>> {
        let at = prefix.map(|p| p.to_string()).unwrap_or_default();
        if let Err(err) = Faults::enter(&self.faults, Op::List, &at) {
            return futures::stream::once(async move { Err(err) }).boxed();
        }
        self.counted(self.inner.list_with_offset(prefix, offset))
    }

    async fn list_with_delimiter(&self, prefix: Option<&Path>) -> Result<ListResult> {
        let at = prefix.map(|p| p.to_string()).unwrap_or_default();
        Faults::enter(&self.faults, Op::List, &at)?;
        self.inner.list_with_delimiter(prefix).await
    }

    async fn copy(&self, from: &Path, to: &Path) -> Result<()> {
        self.inner.copy(from, to).await
    }

    async fn copy_if_not_exists(&self, from: &Path, to: &Path) -> Result<()> {
        self.inner.copy_if_not_exists(from, to).await
    }
}

/// Multipart upload whose parts and completion can be made to fail.
#[derive(Debug)]
struct FlakyUpload {
    inner: Box<dyn MultipartUpload>,
    location: String,
    faults: Arc<Mutex<Faults>>,
}

#[async_trait]
impl MultipartUpload for FlakyUpload {
    fn put_part(&mut self, data: PutPayload) -> UploadPart {
        match Faults::enter(&self.faults, Op::Part, &self.location) {
            Ok(()) => self.inner.put_part(data),
            Err(err) => Box::pin(async move { Err(err) }),
        }
    }

    async fn complete(&mut self) -> Result<PutResult> {
        Faults::enter(&self.faults, Op::Complete, &self.location)?;
        self.inner.complete().await
    }

    async fn abort(&mut self) -> Result<()> {
        self.faults
            .lock()
            .unwrap()
            .calls
            .entry(Op::Abort)
            .and_modify(|n| *n += 1)
            .or_insert(1);
        self.inner.abort().await
    }
}

/// Client over `store` with millisecond backoff so retry tests stay fast.
pub fn client_for(store: &Arc<FlakyStore>) -> ObjectStorageClient {
    let store: Arc<dyn ObjectStore> = store.clone();
    ObjectStorageClient::with_store("tenders", store)
        .unwrap()
        .with_retry_policy(RetryPolicy::new(3, Duration::from_millis(1)))
}

/// Write `contents` to `dir/name` and return the path.
pub fn local_file(dir: &std::path::Path, name: &str, contents: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}
