//! Command-line actions: one-shot uploads, writing a starter config, and removing local state.
//!
//! Uploads go through the same [`Lifecycle`] as the server, so a signal during a long upload drains
//! it the same way.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use url::Url;

use crate::backends::{BackendEndpoint, Credential};
use crate::cleanup::{self, CleanupStatus, MissingPolicy};
use crate::config::{Config, UploadTarget};
use crate::content::{ContentInput, FileInput, TreeEntry};
use crate::fanout::{AddOptions, AggregateResult};
use crate::lifecycle::Lifecycle;

/// Files removed by `reset`, besides the config file itself.
const ENV_FILE: &str = ".env";

/// Upload `target` and print a summary for every result.
///
/// Fails if any result has no successful backend.
pub async fn upload(lifecycle: &Lifecycle, target: UploadTarget, deadline: Option<Duration>) -> anyhow::Result<()> {
    let input = read_target(target).await?;
    let results = lifecycle.add(input, AddOptions { deadline }).await?;

    let mut failed = 0;
    for result in &results {
        println!("{}", render_result(result));
        if !result.success {
            println!("{}", serde_json::to_string_pretty(result)?);
            failed += 1;
        }
    }

    if failed > 0 {
        bail!("Upload failed");
    }
    Ok(())
}

async fn read_target(target: UploadTarget) -> anyhow::Result<ContentInput> {
    Ok(match target {
        UploadTarget::File { paths } => {
            let mut files = Vec::with_capacity(paths.len());
            for path in &paths {
                files.push(read_file(path).await?);
            }
            match files.len() {
                1 => ContentInput::File(files.remove(0)),
                _ => ContentInput::Files(files),
            }
        }
        UploadTarget::Text { text } => ContentInput::Text(text),
        UploadTarget::Json { path } => {
            let raw = tokio::fs::read(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let value = serde_json::from_slice(&raw).with_context(|| format!("{} is not valid JSON", path.display()))?;
            ContentInput::Json(value)
        }
        UploadTarget::Dir { path } => ContentInput::Tree(read_tree(&path).await?),
    })
}

async fn read_file(path: &Path) -> anyhow::Result<FileInput> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let media_type = mime_guess::from_path(path).first_or_octet_stream();

    Ok(FileInput::new(name, bytes).with_media_type(media_type.essence_str()))
}

/// Every regular file under `root`, keyed by its `/`-joined path relative to `root`.
async fn read_tree(root: &Path) -> anyhow::Result<Vec<TreeEntry>> {
    let mut entries = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut listing = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("Failed to read directory {}", dir.display()))?;

        while let Some(entry) = listing.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                let bytes = tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                entries.push(TreeEntry::new(relative_path(root, &path)?, bytes));
            }
        }
    }

    if entries.is_empty() {
        bail!("{} contains no files", root.display());
    }
    // Directory listing order is platform dependent
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

fn relative_path(root: &Path, path: &Path) -> anyhow::Result<String> {
    let relative = path.strip_prefix(root)?;
    let segments: Vec<_> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(segments.join("/"))
}

/// One-line summary in the form the upload commands print.
pub fn render_result(result: &AggregateResult) -> String {
    match &result.cid {
        Some(cid) if result.success => {
            let detail = if result.error_count > 0 {
                format!("{} / {} nodes failed", result.error_count, result.total_nodes)
            } else {
                format!("Uploaded to {} / {} nodes", result.success_count, result.total_nodes)
            };
            let mismatch = if result.identifier_mismatch {
                " (nodes disagreed on the CID)"
            } else {
                ""
            };
            format!("File uploaded successfully. CID: {cid}{mismatch}\n{detail}")
        }
        _ => "Upload failed".to_string(),
    }
}

/// Write a config file with a single backend. Refuses to overwrite unless `force` is set.
pub async fn init(config_path: &Path, url: Url, api_key: Option<String>, force: bool) -> anyhow::Result<()> {
    if !force && tokio::fs::try_exists(config_path).await? {
        bail!("{} already exists; pass --force to overwrite it", config_path.display());
    }

    let mut endpoint = BackendEndpoint::new("default", url);
    if let Some(api_key) = api_key {
        endpoint = endpoint.with_credential(Credential::api_key(api_key));
    }
    let config = Config {
        backends: vec![endpoint],
        ..Config::default()
    };
    config.validate()?;

    let yaml = serde_yaml::to_string(&config)?;
    tokio::fs::write(config_path, yaml)
        .await
        .with_context(|| format!("Failed to write {}", config_path.display()))?;

    println!("Wrote {}", config_path.display());
    Ok(())
}

/// Remove the config file and `.env` next to it. Without `force`, only warns.
pub async fn reset(config_path: &Path, force: bool) -> anyhow::Result<()> {
    let env_file = config_path
        .parent()
        .map(|dir| dir.join(ENV_FILE))
        .unwrap_or_else(|| PathBuf::from(ENV_FILE));
    let targets = [config_path.to_path_buf(), env_file];

    if !force {
        tracing::warn!("This will remove {} and {}", targets[0].display(), targets[1].display());
        println!("Re-run with --force to remove the configuration");
        return Ok(());
    }

    let outcomes = cleanup::remove_all(&targets, MissingPolicy::Ignore).await;
    for outcome in &outcomes {
        match &outcome.status {
            CleanupStatus::Removed => println!("Removed {}", outcome.path.display()),
            CleanupStatus::SkippedMissing => println!("Skipped {} (not found)", outcome.path.display()),
            CleanupStatus::Failed(e) => println!("Failed to remove {}: {}", outcome.path.display(), e),
        }
    }

    let failures = outcomes.iter().filter(|o| o.is_failure()).count();
    if failures > 0 {
        bail!("Reset failed for {} of {} paths", failures, outcomes.len());
    }
    println!("Reset complete");
    Ok(())
}
