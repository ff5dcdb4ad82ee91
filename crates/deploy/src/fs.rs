//! File system utils.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use notify::{Event, RecursiveMode, Watcher};
use tokio::sync::watch;

pub struct FsHandler;

impl FsHandler {
    pub fn set_writable(path: &Path) -> anyhow::Result<()> {
        let metadata = std::fs::metadata(path).context("Failed to get metadata for file")?;

        let mut perms = metadata.permissions();

        #[allow(clippy::permissions_set_readonly_false)]
        perms.set_readonly(false);

        std::fs::set_permissions(path, perms)
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;

        Ok(())
    }

    /// Create a directory that a container bind-mounts and writes into.
    pub fn create_bind_directory(path: &Path) -> anyhow::Result<()> {
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory {}", path.display()))?;
        tracing::trace!("Created directory: {}", path.display());

        Self::set_writable(path)
    }

    /// Every file with extension `ext` under `dir`, recursively, in sorted order.
    pub fn collect_files(dir: &Path, ext: &str) -> anyhow::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut pending = vec![dir.to_path_buf()];

        while let Some(current) = pending.pop() {
            let entries = std::fs::read_dir(&current)
                .with_context(|| format!("Failed to read directory {}", current.display()))?;

            for entry in entries {
                let path = entry
                    .with_context(|| format!("Failed to read entry in {}", current.display()))?
                    .path();
                if path.is_dir() {
                    pending.push(path);
                } else if path.extension().is_some_and(|e| e == ext) {
                    files.push(path);
                }
            }
        }

        files.sort();
        Ok(files)
    }

    /// Wait for a file to be created with a timeout.
    ///
    /// This function uses file system watching (via notify crate) to efficiently
    /// wait for a file to appear.
    ///
    /// # Arguments
    /// * `path` - The path to wait for
    /// * `timeout` - Maximum duration to wait
    ///
    /// # Returns
    /// Ok(()) if the file was created/exists, Err if timeout or other error
    pub async fn wait_for_file(path: &Path, timeout: Duration) -> anyhow::Result<()> {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            tracing::trace!("File already exists: {}", path.display());
            return Ok(());
        }

        tracing::debug!("Waiting for file: {}", path.display());

        let parent = path
            .parent()
            .context("File path must have a parent directory")?;

        let (tx, mut rx) = watch::channel(None);

        let path_watcher = path.to_path_buf();
        let mut watcher =
            notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
                Ok(event) if (event.kind.is_create() || event.kind.is_modify()) && event.paths.contains(&path_watcher) => {
                    tracing::debug!(event = ?event, path = ?path_watcher.display(), "File detected");

                    if let Err(e) = tx.send(Some(event.clone())) {
                        tracing::error!(err = ?e, event = ?event, path = ?path_watcher.display(), "Failed to send event to channel");
                    }
                }
                Ok(event) => {
                    tracing::trace!(event = ?event, path = ?path_watcher.display(), "Ignored event emitted by file watcher");
                }
                Err(e) => {
                    tracing::error!(err = ?e, path = ?path_watcher.display(), "Failed to watch directory");
                }
            })
            .context("Failed to create file watcher")?;

        watcher
            .watch(parent, RecursiveMode::NonRecursive)
            .context("Failed to watch directory")?;

        // The file may have appeared between the first check and the watch.
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(());
        }

        tokio::time::timeout(timeout, async {
            rx.changed()
                .await
                .map_err(|e| anyhow::anyhow!("File watcher channel closed: {}", e))
        })
        .await
        .with_context(|| format!("Timeout waiting for file: {}", path.display()))??;

        // File watcher may trigger on file creation before the writer has finished.
        tokio::time::sleep(Duration::from_millis(100)).await;

        Ok(())
    }
}
