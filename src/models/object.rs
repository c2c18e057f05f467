//! Represents an object (file) stored in the bucket and the shapes used to
//! move one in or out.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::errors::StorageError;

/// Metadata of a stored object as reported by a HEAD request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectInfo {
    /// Object key (path-like identifier within the bucket).
    pub key: String,

    /// Size in bytes.
    pub size: u64,

    /// Timestamp when object was last modified.
    pub last_modified: DateTime<Utc>,

    /// Entity tag assigned by the store, if any.
    pub e_tag: Option<String>,

    /// Version identifier if the store versions objects.
    pub version: Option<String>,
}

impl From<object_store::ObjectMeta> for ObjectInfo {
    fn from(meta: object_store::ObjectMeta) -> Self {
        Self {
            key: meta.location.to_string(),
            size: meta.size,
            last_modified: meta.last_modified,
            e_tag: meta.e_tag,
            version: meta.version,
        }
    }
}

/// Invoked with the cumulative number of bytes transferred so far.
pub type ProgressCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Where upload bytes come from.
pub enum UploadSource {
    /// A local file; its size is taken from the filesystem.
    Path(PathBuf),
    /// An in-memory, seekable buffer of known length.
    Bytes(Bytes),
    /// A non-seekable stream of unknown length. It can only be read once.
    Reader(Box<dyn AsyncRead + Send + Unpin>),
}

impl UploadSource {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        UploadSource::Path(path.into())
    }

    /// File name used for content-type inference when none is given.
    pub fn file_name(&self) -> Option<&str> {
        match self {
            UploadSource::Path(path) => path.file_name().and_then(|n| n.to_str()),
            _ => None,
        }
    }
}

impl fmt::Debug for UploadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadSource::Path(path) => f.debug_tuple("Path").field(path).finish(),
            UploadSource::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            UploadSource::Reader(_) => f.write_str("Reader(..)"),
        }
    }
}

impl From<Bytes> for UploadSource {
    fn from(bytes: Bytes) -> Self {
        UploadSource::Bytes(bytes)
    }
}

impl From<&Path> for UploadSource {
    fn from(path: &Path) -> Self {
        UploadSource::Path(path.to_path_buf())
    }
}

/// Where downloaded bytes go.
pub enum DownloadTarget<'a> {
    /// A local file, written atomically through a sibling temp file.
    Path(PathBuf),
    /// A caller-owned writer, written once after the fetch completes.
    Writer(&'a mut (dyn AsyncWrite + Send + Unpin)),
}

impl fmt::Debug for DownloadTarget<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadTarget::Path(path) => f.debug_tuple("Path").field(path).finish(),
            DownloadTarget::Writer(_) => f.write_str("Writer(..)"),
        }
    }
}

/// Optional knobs for a single upload.
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    /// User metadata stored alongside the object.
    pub metadata: HashMap<String, String>,

    /// Content type; inferred from the file name when absent.
    pub content_type: Option<String>,
}

/// What a successful upload wrote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadReceipt {
    pub key: String,
    pub size: u64,
    pub content_type: String,
    pub e_tag: Option<String>,
    /// Hex MD5 of the bytes sent, computed while streaming.
    pub md5: String,
    pub multipart: bool,
}

/// What a successful download produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadReceipt {
    pub key: String,
    pub size: u64,
    /// Hex MD5 of the bytes received.
    pub md5: String,
    pub multipart: bool,
}

/// Per-file result of a batch upload.
#[derive(Debug)]
pub struct UploadOutcome {
    pub source: PathBuf,
    pub key: String,
    pub result: Result<UploadReceipt, StorageError>,
}

/// Ordered outcomes of `put_objects`, one per source, in upload sequence.
#[derive(Debug, Default)]
pub struct BatchUploadReport {
    pub outcomes: Vec<UploadOutcome>,
}

impl BatchUploadReport {
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.total() - self.succeeded()
    }

    pub fn is_complete_success(&self) -> bool {
        self.failed() == 0
    }

    pub fn outcome(&self, source: &Path) -> Option<&UploadOutcome> {
        self.outcomes.iter().find(|o| o.source == source)
    }

    /// Keys that were written, in upload order.
    pub fn uploaded_keys(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| o.result.is_ok())
            .map(|o| o.key.as_str())
            .collect()
    }
}
