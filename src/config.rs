use crate::errors::{StorageError, StorageResult};
use std::{env, str::FromStr, time::Duration};

const DEFAULT_REGION: &str = "us-east-1";
const DEFAULT_POOL_SIZE: usize = 10;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_READ_TIMEOUT_SECS: u64 = 60;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BACKOFF_FACTOR_MS: u64 = 500;
const DEFAULT_LIST_PAGE_SIZE: usize = 1000;

/// How the metadata index is written back to the bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexWriteMode {
    /// Unconditional put. Concurrent read-modify-write cycles can lose updates.
    #[default]
    Overwrite,
    /// Create-if-absent and update-if-etag-matches; conflicts are re-applied.
    Conditional,
}

impl FromStr for IndexWriteMode {
    type Err = StorageError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "overwrite" => Ok(IndexWriteMode::Overwrite),
            "conditional" => Ok(IndexWriteMode::Conditional),
            other => Err(StorageError::Configuration(format!(
                "unknown index write mode `{}` (expected `overwrite` or `conditional`)",
                other
            ))),
        }
    }
}

/// Centralized client configuration.
/// Combines built-in defaults, environment variables and explicit overrides.
#[derive(Clone)]
pub struct StorageConfig {
    pub bucket: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint: Option<String>,
    pub region: String,
    pub allow_http: bool,
    pub pool_size: usize,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub max_retries: u32,
    pub backoff_factor: Duration,
    pub list_page_size: usize,
    pub index_write_mode: IndexWriteMode,
}

// Hand-written so the secret never lands in logs.
impl std::fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageConfig")
            .field("bucket", &self.bucket)
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_ref().map(|_| "***"),
            )
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("allow_http", &self.allow_http)
            .field("pool_size", &self.pool_size)
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("max_retries", &self.max_retries)
            .field("backoff_factor", &self.backoff_factor)
            .field("list_page_size", &self.list_page_size)
            .field("index_write_mode", &self.index_write_mode)
            .finish()
    }
}

/// Explicit values that win over the environment (CLI flags, embedding hosts).
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub bucket: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub pool_size: Option<usize>,
    pub connect_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    pub backoff_factor: Option<Duration>,
    pub index_write_mode: Option<IndexWriteMode>,
}

impl StorageConfig {
    /// Minimal configuration for a known bucket, everything else defaulted.
    pub fn for_bucket(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            access_key_id: None,
            secret_access_key: None,
            endpoint: None,
            region: DEFAULT_REGION.into(),
            allow_http: false,
            pool_size: DEFAULT_POOL_SIZE,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_factor: Duration::from_millis(DEFAULT_BACKOFF_FACTOR_MS),
            list_page_size: DEFAULT_LIST_PAGE_SIZE,
            index_write_mode: IndexWriteMode::Overwrite,
        }
    }

    /// Read the process environment, then apply `overrides`.
    pub fn from_env(overrides: ConfigOverrides) -> StorageResult<Self> {
        Self::from_lookup(|name| env::var(name).ok(), overrides)
    }

    /// Same as [`StorageConfig::from_env`] with an injectable variable lookup.
    pub fn from_lookup<F>(lookup: F, overrides: ConfigOverrides) -> StorageResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |names: &[&str]| -> Option<String> {
            names
                .iter()
                .filter_map(|name| lookup(name))
                .map(|value| value.trim().to_string())
                .find(|value| !value.is_empty())
        };

        let bucket = overrides
            .bucket
            .or_else(|| var(&["S3_BUCKET_NAME"]))
            .map(|b| b.trim().to_string())
            .filter(|b| !b.is_empty())
            .ok_or_else(|| {
                StorageError::Configuration(
                    "bucket name missing: pass it explicitly or set S3_BUCKET_NAME".into(),
                )
            })?;

        let mut cfg = Self::for_bucket(bucket);

        cfg.access_key_id = overrides
            .access_key_id
            .or_else(|| var(&["S3_ACCESS_KEY_ID", "AWS_ACCESS_KEY_ID"]));
        cfg.secret_access_key = overrides
            .secret_access_key
            .or_else(|| var(&["S3_SECRET_ACCESS_KEY", "AWS_SECRET_ACCESS_KEY"]));
        cfg.endpoint = overrides.endpoint.or_else(|| var(&["S3_ENDPOINT_URL"]));
        if let Some(region) = overrides.region.or_else(|| var(&["S3_REGION", "AWS_REGION"])) {
            cfg.region = region;
        }
        cfg.allow_http = cfg
            .endpoint
            .as_deref()
            .is_some_and(|e| e.starts_with("http://"));

        cfg.pool_size = match overrides.pool_size {
            Some(v) => v,
            None => parse_var(&var, "S3_POOL_SIZE")?.unwrap_or(cfg.pool_size),
        };
        cfg.connect_timeout = match overrides.connect_timeout {
            Some(v) => v,
            None => parse_var(&var, "S3_CONNECT_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(cfg.connect_timeout),
        };
        cfg.read_timeout = match overrides.read_timeout {
            Some(v) => v,
            None => parse_var(&var, "S3_READ_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(cfg.read_timeout),
        };
        cfg.max_retries = match overrides.max_retries {
            Some(v) => v,
            None => parse_var(&var, "S3_MAX_RETRIES")?.unwrap_or(cfg.max_retries),
        };
        cfg.backoff_factor = match overrides.backoff_factor {
            Some(v) => v,
            None => parse_var(&var, "S3_BACKOFF_FACTOR_MS")?
                .map(Duration::from_millis)
                .unwrap_or(cfg.backoff_factor),
        };
        cfg.list_page_size =
            parse_var(&var, "S3_LIST_PAGE_SIZE")?.unwrap_or(cfg.list_page_size);
        cfg.index_write_mode = match overrides.index_write_mode {
            Some(v) => v,
            None => parse_var(&var, "S3_INDEX_WRITE_MODE")?.unwrap_or(cfg.index_write_mode),
        };

        if cfg.access_key_id.is_some() != cfg.secret_access_key.is_some() {
            return Err(StorageError::Configuration(
                "access key id and secret access key must be provided together".into(),
            ));
        }
        if cfg.pool_size == 0 {
            return Err(StorageError::Configuration(
                "S3_POOL_SIZE must be at least 1".into(),
            ));
        }

        Ok(cfg)
    }
}

fn parse_var<T, V>(var: &V, name: &str) -> StorageResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    V: Fn(&[&str]) -> Option<String>,
{
    match var(&[name]) {
        Some(value) => value.parse::<T>().map(Some).map_err(|err| {
            StorageError::Configuration(format!("parsing {} value `{}`: {}", name, value, err))
        }),
        None => Ok(None),
    }
}
