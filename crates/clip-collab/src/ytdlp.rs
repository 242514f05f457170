//! yt-dlp fetcher.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;
use ulid::Ulid;

use clip_core::{ClipError, FetchConfig, FetchedMedia, Fetcher, Result};

use crate::process;

const TOOL: &str = "fetcher";

/// Container extensions yt-dlp may produce, in lookup order.
const MEDIA_EXTENSIONS: [&str; 5] = ["mp4", "mkv", "webm", "flv", "mov"];

/// Downloads a source URL with yt-dlp into the staging directory.
pub struct YtDlpFetcher {
    bin: PathBuf,
    format: String,
}

impl YtDlpFetcher {
    pub fn new(config: &FetchConfig) -> Self {
        Self {
            bin: config.ytdlp_bin.clone(),
            format: config.format.clone(),
        }
    }

    async fn media_id(&self, url: &str) -> Result<String> {
        let mut cmd = Command::new(&self.bin);
        cmd.args(["--no-playlist", "--get-id", url]);
        let output = process::run(TOOL, &mut cmd).await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(sanitize)
            .ok_or_else(|| ClipError::collaborator(TOOL, format!("no media id for {}", url)))
    }
}

#[async_trait]
impl Fetcher for YtDlpFetcher {
    async fn fetch(&self, url: &str, staging_dir: &Path) -> Result<FetchedMedia> {
        tokio::fs::create_dir_all(staging_dir).await?;

        let media_id = self.media_id(url).await?;

        // Unique stem so concurrent fetches of one id never share a file.
        let stem = format!("{}-{}", media_id, Ulid::new());
        let template = staging_dir.join(format!("{}.%(ext)s", stem));

        let mut cmd = Command::new(&self.bin);
        cmd.args(["--no-playlist", "--no-part", "-f", &self.format, "-o"])
            .arg(&template)
            .arg(url);
        process::run(TOOL, &mut cmd).await?;

        let path = locate(staging_dir, &stem).ok_or_else(|| {
            ClipError::collaborator(
                TOOL,
                format!("unable to locate downloaded file for {}", url),
            )
        })?;

        info!(media_id = %media_id, "Downloaded {} to {:?}", url, path);
        Ok(FetchedMedia {
            path,
            media_id: Some(media_id),
        })
    }
}

fn locate(dir: &Path, stem: &str) -> Option<PathBuf> {
    MEDIA_EXTENSIONS
        .iter()
        .map(|ext| dir.join(format!("{}.{}", stem, ext)))
        .find(|p| p.is_file())
}

/// Keep ids safe to use as a file name.
fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("dQw4w9WgXcQ"), "dQw4w9WgXcQ");
        assert_eq!(sanitize("../etc/passwd"), "___etc_passwd");
    }

    #[test]
    fn test_locate_prefers_known_extensions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("abc-1.webm"), b"x").unwrap();
        std::fs::write(dir.path().join("abc-1.info.json"), b"{}").unwrap();

        assert_eq!(
            locate(dir.path(), "abc-1"),
            Some(dir.path().join("abc-1.webm"))
        );
        assert_eq!(locate(dir.path(), "other"), None);
    }
}
