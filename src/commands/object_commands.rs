//! Single-object and batch subcommands.

use super::print_json;
use anyhow::{Context, Result, bail};
use serde::Serialize;
use std::{path::PathBuf, sync::Arc};
use tender_store::{
    BatchUploadOptions, DownloadTarget, ObjectStorageClient, ProgressCallback, UploadOptions,
    UploadSource,
};

#[derive(Serialize)]
struct BatchLine {
    source: String,
    key: String,
    ok: bool,
    error: Option<String>,
}

pub async fn put(
    client: &ObjectStorageClient,
    file: PathBuf,
    key: Option<String>,
    content_type: Option<String>,
    metadata: Vec<(String, String)>,
) -> Result<()> {
    let key = match key {
        Some(key) => key,
        None => file
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .with_context(|| format!("cannot derive a key from {}", file.display()))?,
    };
    let options = UploadOptions {
        metadata: metadata.into_iter().collect(),
        content_type,
    };
    let receipt = client
        .put_object(UploadSource::Path(file), &key, &options)
        .await?;
    print_json(&receipt)
}

pub async fn put_many(
    client: &ObjectStorageClient,
    files: &[PathBuf],
    prefix: Option<String>,
) -> Result<()> {
    let options = BatchUploadOptions {
        key_prefix: prefix,
        ..Default::default()
    };
    let report = client.put_objects(files, &options).await;
    let lines: Vec<BatchLine> = report
        .outcomes
        .iter()
        .map(|o| BatchLine {
            source: o.source.display().to_string(),
            key: o.key.clone(),
            ok: o.result.is_ok(),
            error: o.result.as_ref().err().map(|e| e.to_string()),
        })
        .collect();
    print_json(&lines)?;
    if !report.is_complete_success() {
        bail!("{} of {} uploads failed", report.failed(), report.total());
    }
    Ok(())
}

pub async fn get(client: &ObjectStorageClient, key: &str, dest: PathBuf) -> Result<()> {
    let progress: ProgressCallback = Arc::new(|bytes: u64| tracing::debug!("received {} bytes", bytes));
    let receipt = client
        .get_object(key, DownloadTarget::Path(dest), Some(progress))
        .await?;
    print_json(&receipt)
}

pub async fn list(client: &ObjectStorageClient, prefix: &str) -> Result<()> {
    for key in client.list_objects(prefix).await? {
        println!("{}", key);
    }
    Ok(())
}

pub async fn delete(client: &ObjectStorageClient, key: &str) -> Result<()> {
    client.delete_object(key).await?;
    Ok(())
}

pub async fn exists(client: &ObjectStorageClient, key: &str) -> Result<()> {
    match client.head_object(key).await? {
        Some(info) => print_json(&info),
        None => bail!("`{}` does not exist", key),
    }
}

pub async fn health(client: &ObjectStorageClient) -> Result<()> {
    let report = client.health_check().await;
    print_json(&report)?;
    if !report.ok {
        bail!("bucket `{}` failed the health check", client.bucket());
    }
    Ok(())
}
