//! Content Ledger: content-addressed placement of downloaded media.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use clip_core::{now_millis, ClipError, FileCommit, FileHandle, Fingerprint, Result, Store};

/// Moves staged downloads into a content-addressed media directory and
/// records them in the store, one File per distinct byte content.
#[derive(Debug, Clone)]
pub struct ContentLedger {
    media_dir: PathBuf,
}

impl ContentLedger {
    pub fn new(media_dir: impl Into<PathBuf>) -> Self {
        Self {
            media_dir: media_dir.into(),
        }
    }

    pub fn media_dir(&self) -> &Path {
        &self.media_dir
    }

    /// Commit a staged download.
    ///
    /// Idempotent per fingerprint: when the content is already known the
    /// staged copy is removed and the existing handle returned with
    /// `created == false`. A concurrent first commit of the same content is
    /// settled by the store's uniqueness constraint. On error the staged
    /// copy is removed as well.
    pub async fn commit_file<S>(
        &self,
        store: &S,
        staged: &Path,
        media_id: Option<String>,
    ) -> Result<FileCommit>
    where
        S: Store + ?Sized,
    {
        let result = self.commit_staged(store, staged, media_id).await;
        if result.is_err() {
            if let Err(e) = discard(staged).await {
                warn!("Could not remove staged file {:?}: {}", staged, e);
            }
        }
        result
    }

    async fn commit_staged<S>(
        &self,
        store: &S,
        staged: &Path,
        media_id: Option<String>,
    ) -> Result<FileCommit>
    where
        S: Store + ?Sized,
    {
        let fingerprint = fingerprint_file(staged).await?;
        let size_bytes = tokio::fs::metadata(staged).await?.len();

        if let Some(existing) = store.get_file(&fingerprint).await? {
            discard(staged).await?;
            debug!(file = %fingerprint, "Content already stored, discarded staged copy");
            return Ok(FileCommit {
                handle: existing,
                created: false,
            });
        }

        let target = self.target_path(&fingerprint, staged);
        tokio::fs::create_dir_all(&self.media_dir).await?;
        place(staged, &target).await?;

        let handle = FileHandle {
            fingerprint,
            size_bytes,
            stored_path: target.clone(),
            media_id,
            first_seen_at: now_millis(),
        };

        let commit = store.insert_file(&handle).await?;
        if commit.created {
            info!(file = %fingerprint, size_bytes, "Stored new file at {:?}", target);
        } else if commit.handle.stored_path != target {
            // Lost the race to a writer that placed the bytes elsewhere.
            discard(&target).await?;
        }

        Ok(commit)
    }

    /// `<media_dir>/<fingerprint-hex>.<ext>`, keeping the staged extension.
    fn target_path(&self, fingerprint: &Fingerprint, staged: &Path) -> PathBuf {
        let name = match staged.extension().and_then(|e| e.to_str()) {
            Some(ext) if !ext.is_empty() => format!("{}.{}", fingerprint.to_hex(), ext),
            _ => fingerprint.to_hex(),
        };
        self.media_dir.join(name)
    }
}

/// Hash a file off the async runtime.
pub async fn fingerprint_file(path: &Path) -> Result<Fingerprint> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || Fingerprint::of_file(&path))
        .await
        .map_err(|e| ClipError::internal(format!("fingerprint task failed: {}", e)))?
}

/// Move `staged` to `target`; if the target already holds the same content
/// name the staged copy is dropped.
async fn place(staged: &Path, target: &Path) -> Result<()> {
    if tokio::fs::try_exists(target).await? {
        return discard(staged).await;
    }

    if tokio::fs::rename(staged, target).await.is_err() {
        // Staging and media dirs may sit on different filesystems.
        tokio::fs::copy(staged, target).await?;
        discard(staged).await?;
    }
    Ok(())
}

async fn discard(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
