//! `group` and `index` subcommands.

use super::{GroupCommand, print_json};
use anyhow::{Context, Result};
use serde_json::Value;
use tender_store::{DocumentGroupManager, IndexWriteMode, MetadataIndex, ObjectStorageClient};

pub async fn show_index(client: ObjectStorageClient, mode: IndexWriteMode) -> Result<()> {
    let index = MetadataIndex::new(client, mode);
    let doc = index.ensure_loaded().await?;
    print_json(&doc)
}

pub async fn run(
    client: ObjectStorageClient,
    mode: IndexWriteMode,
    command: GroupCommand,
) -> Result<()> {
    let manager = DocumentGroupManager::open(client, mode).await?;
    match command {
        GroupCommand::Create {
            group_id,
            files,
            publication,
            data,
        } => {
            let report = match data {
                Some(raw) => {
                    let data: Value =
                        serde_json::from_str(&raw).context("parsing --data as JSON")?;
                    manager
                        .create_group_with_data(&group_id, &files, publication, data)
                        .await?
                }
                None => manager.create_group(&group_id, &files, publication).await?,
            };
            print_json(&report.uploaded_keys())
        }
        GroupCommand::Add { group_id, files } => {
            let report = manager.add_documents(&group_id, &files).await?;
            print_json(&report.uploaded_keys())
        }
        GroupCommand::List { group_id } => {
            for key in manager.list_group_documents(&group_id).await? {
                println!("{}", key);
            }
            Ok(())
        }
        GroupCommand::Download { group_id, dir } => {
            let receipts = manager.download_group(&group_id, &dir).await?;
            print_json(&receipts)
        }
    }
}
