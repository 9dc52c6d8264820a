use anyhow::{anyhow, bail, Context, Result};
use futures::TryStreamExt;
use log::info;

use super::Commands;
use gridstore::{FileFilter, GridStore, StoreOptions};

pub async fn handle_cli(cmd: Commands, store: &GridStore) -> Result<()> {
    match cmd {
        Commands::Init => {
            // GridStore::initialize has already set everything up
            println!(
                "Bucket {} ready ({}, {})",
                store.config().bucket_name,
                store.files().name(),
                store.chunks().name()
            );
        }
        Commands::Put {
            file_path,
            name,
            chunk_size,
            content_type,
            alias,
        } => {
            let data = tokio::fs::read(&file_path)
                .await
                .with_context(|| format!("Failed to read {}", file_path.display()))?;
            let filename = match name {
                Some(n) => n,
                None => file_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or_else(|| anyhow!("{} has no file name", file_path.display()))?,
            };
            let options = StoreOptions {
                filename: Some(filename),
                content_type,
                aliases: alias,
                chunk_size,
                ..Default::default()
            };
            let id = store.store_file_with(data, options).await?;
            println!("Uploaded: {}", id);
        }
        Commands::Get { id, name, md5, output } => {
            if id.is_none() && name.is_none() && md5.is_none() {
                bail!("Give at least one of --id, --name or --md5");
            }
            let filter = FileFilter { id, checksum: md5, filename: name };
            let file = store
                .find_one_file(&filter)
                .await?
                .ok_or_else(|| anyhow!("File not found"))?;
            let data = file.read_to_end().await?;
            tokio::fs::write(&output, &data)
                .await
                .with_context(|| format!("Failed to write {}", output.display()))?;
            info!("wrote {} bytes of file {}", data.len(), file.id());
            println!("Downloaded to {}", output.display());
        }
        Commands::Ls { name, md5, json } => {
            let filter = FileFilter { id: None, checksum: md5, filename: name };
            let mut files = store.find_files(&filter).await?;
            while let Some(f) = files.try_next().await? {
                if json {
                    println!("{}", serde_json::to_string(f.record())?);
                    continue;
                }
                println!(
                    "{} - {} ({} bytes, md5 {}, uploaded {})",
                    f.id(),
                    f.filename().unwrap_or("<unnamed>"),
                    f.length(),
                    f.checksum(),
                    f.upload_date().to_rfc3339()
                );
            }
        }
        Commands::Chunks { file_id, skip, limit } => {
            let file = store
                .find_one_file(&FileFilter::all().id(file_id))
                .await?
                .ok_or_else(|| anyhow!("File not found"))?;
            println!(
                "File {}: {} bytes, chunk size {}, {} chunks expected",
                file.id(),
                file.length(),
                file.chunk_size(),
                file.chunk_count()
            );
            let mut chunks = file.find_chunks(skip, limit).await?;
            while let Some(c) = chunks.try_next().await? {
                println!("  #{} - {} bytes", c.n, c.len());
            }
        }
        Commands::Rm { file_id } => {
            if store.delete_file(file_id).await? {
                println!("Deleted: {}", file_id);
            } else {
                println!("No file {}", file_id);
            }
        }
    }
    Ok(())
}
