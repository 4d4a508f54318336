//! The `pixpress add` command: register an upload as a pending task.

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use pixpress_core::{Config, FileTask, Storage, TaskStore};
use tokio::io::AsyncWriteExt;

use super::Services;

/// Arguments for the `add` command.
#[derive(Args, Debug)]
pub struct AddArgs {
    /// Image file to copy into storage
    #[arg(required = true)]
    pub file: PathBuf,

    /// Storage key (defaults to `uploads/<file name>`)
    #[arg(short, long)]
    pub key: Option<String>,

    /// Display name (defaults to the file name)
    #[arg(short, long)]
    pub name: Option<String>,
}

/// Execute the add command.
pub async fn execute(args: AddArgs, config: &Config) -> anyhow::Result<()> {
    let services = Services::open(config)?;
    let task = add_file(&services, &args).await?;

    println!("{}", serde_json::to_string_pretty(&task)?);
    Ok(())
}

/// Copy the file into storage and create its `pending` row.
pub async fn add_file(services: &Services, args: &AddArgs) -> anyhow::Result<FileTask> {
    let path = super::expand_path(&args.file);
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .with_context(|| format!("Not a file path: {}", path.display()))?;

    let bytes = tokio::fs::read(&path)
        .await
        .with_context(|| format!("Cannot read {}", path.display()))?;

    let key = args
        .key
        .clone()
        .unwrap_or_else(|| services.storage.join("uploads", &file_name));
    let name = args.name.clone().unwrap_or(file_name);

    let mut writer = services
        .storage
        .create(&key)
        .await
        .with_context(|| format!("Cannot create storage object {key}"))?;
    writer.write_all(&bytes).await?;
    writer.shutdown().await?;

    let task = services.store.create_task(&name, &key)?;
    tracing::info!("Registered file {} ({} bytes) as {}", task.id, bytes.len(), key);
    Ok(task)
}
