//! Command-line surface of `tender-store`.
//!
//! Flags override the `S3_*` environment, which overrides built-in defaults.

pub mod group_commands;
pub mod object_commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::{path::PathBuf, time::Duration};
use tender_store::{ConfigOverrides, IndexWriteMode, ObjectStorageClient, StorageConfig};

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Tender document storage on S3-compatible buckets")]
pub struct Args {
    /// Bucket name (overrides S3_BUCKET_NAME)
    #[arg(long, global = true)]
    pub bucket: Option<String>,

    /// Endpoint URL for non-AWS stores (overrides S3_ENDPOINT_URL)
    #[arg(long, global = true)]
    pub endpoint: Option<String>,

    /// Region (overrides S3_REGION)
    #[arg(long, global = true)]
    pub region: Option<String>,

    /// Retries after the first attempt (overrides S3_MAX_RETRIES)
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,

    /// Base backoff in milliseconds (overrides S3_BACKOFF_FACTOR_MS)
    #[arg(long, global = true)]
    pub backoff_ms: Option<u64>,

    /// Connection pool size (overrides S3_POOL_SIZE)
    #[arg(long, global = true)]
    pub pool_size: Option<usize>,

    /// Connect timeout in seconds (overrides S3_CONNECT_TIMEOUT_SECS)
    #[arg(long, global = true)]
    pub connect_timeout_secs: Option<u64>,

    /// Read timeout in seconds (overrides S3_READ_TIMEOUT_SECS)
    #[arg(long, global = true)]
    pub read_timeout_secs: Option<u64>,

    /// `overwrite` or `conditional` (overrides S3_INDEX_WRITE_MODE)
    #[arg(long, global = true)]
    pub index_mode: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Upload one file
    Put {
        file: PathBuf,
        /// Destination key (defaults to the file name)
        #[arg(long)]
        key: Option<String>,
        #[arg(long)]
        content_type: Option<String>,
        /// User metadata as NAME=VALUE, repeatable
        #[arg(long = "meta", value_parser = parse_key_val)]
        metadata: Vec<(String, String)>,
    },
    /// Upload several files, continuing past failures
    PutMany {
        files: Vec<PathBuf>,
        /// Keys become PREFIX/<file name>
        #[arg(long)]
        prefix: Option<String>,
    },
    /// Download an object to a local path
    Get { key: String, dest: PathBuf },
    /// List keys starting with a prefix
    List {
        #[arg(default_value = "")]
        prefix: String,
    },
    /// Delete an object
    Delete { key: String },
    /// Check whether an object exists
    Exists { key: String },
    /// Write, read back and delete a scratch object
    Health,
    /// Inspect the group index
    Index {
        #[command(subcommand)]
        command: IndexCommand,
    },
    /// Manage tender groups
    Group {
        #[command(subcommand)]
        command: GroupCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum IndexCommand {
    /// Print the index document
    Show,
}

#[derive(Subcommand, Debug)]
pub enum GroupCommand {
    /// Upload publication files and register the group
    Create {
        group_id: String,
        files: Vec<PathBuf>,
        #[arg(long)]
        publication: bool,
        /// JSON payload stored with the group
        #[arg(long)]
        data: Option<String>,
    },
    /// Upload supplementary documents to a registered group
    Add { group_id: String, files: Vec<PathBuf> },
    /// List the keys stored under a group
    List { group_id: String },
    /// Download a whole group below a directory
    Download { group_id: String, dir: PathBuf },
}

impl Args {
    pub fn overrides(&self) -> Result<ConfigOverrides> {
        let index_write_mode = self
            .index_mode
            .as_deref()
            .map(str::parse::<IndexWriteMode>)
            .transpose()
            .context("parsing --index-mode")?;
        Ok(ConfigOverrides {
            bucket: self.bucket.clone(),
            endpoint: self.endpoint.clone(),
            region: self.region.clone(),
            pool_size: self.pool_size,
            connect_timeout: self.connect_timeout_secs.map(Duration::from_secs),
            read_timeout: self.read_timeout_secs.map(Duration::from_secs),
            max_retries: self.max_retries,
            backoff_factor: self.backoff_ms.map(Duration::from_millis),
            index_write_mode,
            ..Default::default()
        })
    }
}

/// Resolve configuration, connect, and dispatch the subcommand.
pub async fn run(args: Args) -> Result<()> {
    let cfg = StorageConfig::from_env(args.overrides()?)?;
    tracing::info!("Using storage config: {:?}", cfg);
    let client = ObjectStorageClient::new(&cfg)?;

    match args.command {
        Command::Put {
            file,
            key,
            content_type,
            metadata,
        } => object_commands::put(&client, file, key, content_type, metadata).await,
        Command::PutMany { files, prefix } => {
            object_commands::put_many(&client, &files, prefix).await
        }
        Command::Get { key, dest } => object_commands::get(&client, &key, dest).await,
        Command::List { prefix } => object_commands::list(&client, &prefix).await,
        Command::Delete { key } => object_commands::delete(&client, &key).await,
        Command::Exists { key } => object_commands::exists(&client, &key).await,
        Command::Health => object_commands::health(&client).await,
        Command::Index {
            command: IndexCommand::Show,
        } => group_commands::show_index(client, cfg.index_write_mode).await,
        Command::Group { command } => {
            group_commands::run(client, cfg.index_write_mode, command).await
        }
    }
}

fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected NAME=VALUE, got `{}`", raw)),
    }
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_become_overrides() {
        let args = Args::parse_from([
            "tender-store",
            "--bucket",
            "tenders",
            "--max-retries",
            "5",
            "--backoff-ms",
            "20",
            "--index-mode",
            "conditional",
            "list",
            "tender-42",
        ]);
        let overrides = args.overrides().unwrap();
        assert_eq!(overrides.bucket.as_deref(), Some("tenders"));
        assert_eq!(overrides.max_retries, Some(5));
        assert_eq!(overrides.backoff_factor, Some(Duration::from_millis(20)));
        assert_eq!(overrides.index_write_mode, Some(IndexWriteMode::Conditional));
        assert!(matches!(args.command, Command::List { prefix } if prefix == "tender-42"));
    }

    #[test]
    fn bad_index_mode_is_rejected() {
        let args = Args::parse_from(["tender-store", "--index-mode", "yolo", "health"]);
        assert!(args.overrides().is_err());
    }

    #[test]
    fn metadata_pairs_parse() {
        assert_eq!(
            parse_key_val("source=portal").unwrap(),
            ("source".to_string(), "portal".to_string())
        );
        assert!(parse_key_val("novalue").is_err());
        assert!(parse_key_val("=x").is_err());
    }
}
