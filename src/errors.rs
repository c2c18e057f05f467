//! Error taxonomy for the storage client and the metadata index.
//!
//! Remote failures are classified once, when they leave `object_store`, into
//! transient (retried by `RetryPolicy`) or permanent (surfaced immediately).

use object_store::client::{HttpError, HttpErrorKind};
use std::{error::Error as StdError, io};
use thiserror::Error;

/// Coarse failure class used by callers and by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Configuration,
}

/// Known transient failure codes. A retry allow-list is expressed in these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransientCode {
    Timeout,
    ConnectionReset,
    ServerError,
    Throttled,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("invalid object key `{key}`: {reason}")]
    InvalidKey { key: String, reason: String },
    #[error("object `{key}` not found")]
    NotFound { key: String },
    #[error("precondition failed for `{key}`")]
    PreconditionFailed { key: String },
    #[error("{operation} failed: {source}")]
    Remote {
        operation: &'static str,
        kind: ErrorKind,
        code: Option<TransientCode>,
        #[source]
        source: object_store::Error,
    },
    #[error("{operation} gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
        #[source]
        last: Box<StorageError>,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("operation cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    /// Wrap an `object_store` failure, classifying it on the way in.
    pub fn remote(operation: &'static str, key: &str, err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { .. } => StorageError::NotFound {
                key: key.to_string(),
            },
            object_store::Error::Precondition { .. } | object_store::Error::AlreadyExists { .. } => {
                StorageError::PreconditionFailed {
                    key: key.to_string(),
                }
            }
            object_store::Error::InvalidPath { source } => StorageError::InvalidKey {
                key: key.to_string(),
                reason: source.to_string(),
            },
            other => {
                let code = classify_remote(&other);
                let kind = if code.is_some() {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Permanent
                };
                StorageError::Remote {
                    operation,
                    kind,
                    code,
                    source: other,
                }
            }
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::Configuration(_) => ErrorKind::Configuration,
            StorageError::Remote { kind, .. } => *kind,
            StorageError::RetriesExhausted { .. } => ErrorKind::Transient,
            StorageError::Io(err) if io_transient_code(err).is_some() => ErrorKind::Transient,
            _ => ErrorKind::Permanent,
        }
    }

    /// The transient code this error carries, if any. Exhausted retries do
    /// not carry one, so they are never retried again by an outer loop.
    pub fn transient_code(&self) -> Option<TransientCode> {
        match self {
            StorageError::Remote { code, .. } => *code,
            StorageError::Io(err) => io_transient_code(err),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

/// Map an `object_store` failure onto a transient code.
///
/// Transport failures are found by walking the source chain for
/// `HttpError`/`io::Error` kinds. Server responses are judged by the status
/// code alone, never by the URI, timing or body around it.
fn classify_remote(err: &object_store::Error) -> Option<TransientCode> {
    let object_store::Error::Generic { source, .. } = err else {
        return None;
    };

    let mut current: Option<&(dyn StdError + 'static)> = Some(&**source);
    while let Some(cause) = current {
        if let Some(http) = cause.downcast_ref::<HttpError>() {
            match http.kind() {
                HttpErrorKind::Timeout => return Some(TransientCode::Timeout),
                HttpErrorKind::Connect | HttpErrorKind::Interrupted => {
                    return Some(TransientCode::ConnectionReset);
                }
                _ => {}
            }
        }
        if let Some(code) = cause.downcast_ref::<io::Error>().and_then(io_transient_code) {
            return Some(code);
        }
        current = cause.source();
    }

    status_code(&err.to_string()).and_then(classify_status)
}

const STATUS_MARKER: &str = "status code: ";

/// Status of a rendered non-2xx response (`... status code: 503 Service Unavailable: ...`).
fn status_code(message: &str) -> Option<u16> {
    let start = message.find(STATUS_MARKER)? + STATUS_MARKER.len();
    let rest = &message[start..];
    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    if digits != 3 {
        return None;
    }
    rest[..3].parse().ok()
}

fn classify_status(status: u16) -> Option<TransientCode> {
    match status {
        408 => Some(TransientCode::Timeout),
        429 | 503 => Some(TransientCode::Throttled),
        500 | 502 | 504 => Some(TransientCode::ServerError),
        _ => None,
    }
}

fn io_transient_code(err: &io::Error) -> Option<TransientCode> {
    match err.kind() {
        io::ErrorKind::TimedOut => Some(TransientCode::Timeout),
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::Interrupted => Some(TransientCode::ConnectionReset),
        _ => None,
    }
}

/// Failures of the metadata index and the group manager built on it.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("index document `{key}` is corrupt: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("group `{0}` is not registered in the index")]
    UnknownGroup(String),
    #[error("index write kept conflicting after {attempts} attempts")]
    Conflict { attempts: u32 },
    #[error("serializing index document: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("{failed} of {total} uploads for group `{group_id}` failed")]
    IncompleteUpload {
        group_id: String,
        failed: usize,
        total: usize,
    },
}

pub type IndexResult<T> = Result<T, IndexError>;
