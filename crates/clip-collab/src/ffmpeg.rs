//! ffmpeg montage compiler.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};
use ulid::Ulid;

use clip_core::{ClipError, CompileConfig, Compiler, MontagePlan, Result};

use crate::process;

const TOOL: &str = "compiler";

/// Cuts each planned clip to its own file, then joins them with the concat
/// demuxer into the plan's output path.
pub struct FfmpegCompiler {
    ffmpeg_bin: PathBuf,
    clips_dir: PathBuf,
}

impl FfmpegCompiler {
    pub fn new(config: &CompileConfig) -> Self {
        Self {
            ffmpeg_bin: config.ffmpeg_bin.clone(),
            clips_dir: config.clips_dir.clone(),
        }
    }

    async fn cut(&self, source: &Path, start: f64, duration: f64, out: &Path) -> Result<()> {
        let mut cmd = Command::new(&self.ffmpeg_bin);
        cmd.args(["-y", "-loglevel", "error", "-ss"])
            .arg(format!("{:.3}", start))
            .arg("-i")
            .arg(source)
            .arg("-t")
            .arg(format!("{:.3}", duration))
            .args([
                "-c:v", "libx264", "-preset", "veryfast", "-c:a", "aac", "-ar", "44100",
            ])
            .arg(out);
        process::run(TOOL, &mut cmd).await?;
        Ok(())
    }

    /// Cut every clip, skipping the ones that fail, and join the rest.
    /// Fails only when no clip could be cut.
    async fn assemble(&self, plan: &MontagePlan, work: &Path) -> Result<PathBuf> {
        let mut parts = Vec::with_capacity(plan.clips.len());
        let mut last_error = None;
        for (i, clip) in plan.clips.iter().enumerate() {
            let out = work.join(format!("clip_{:04}.mp4", i));
            let duration = clip.end_ts - clip.start_ts;
            debug!(
                rank = clip.rank,
                "Cutting {:?} at {:.1}-{:.1}s", clip.source, clip.start_ts, clip.end_ts
            );
            match self.cut(&clip.source, clip.start_ts, duration, &out).await {
                Ok(()) => parts.push(out),
                Err(e) => {
                    warn!(rank = clip.rank, "Skipping clip from {:?}: {}", clip.source, e);
                    last_error = Some(e);
                }
            }
        }

        if parts.is_empty() {
            return Err(ClipError::collaborator(
                TOOL,
                format!(
                    "no clip could be cut ({} planned): {}",
                    plan.clips.len(),
                    last_error.map(|e| e.to_string()).unwrap_or_default()
                ),
            ));
        }
        if parts.len() < plan.clips.len() {
            warn!(
                "Montage uses {} of {} planned clips",
                parts.len(),
                plan.clips.len()
            );
        }

        let list = work.join("concat.txt");
        tokio::fs::write(&list, concat_list(&parts)).await?;

        if let Some(parent) = plan.output.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut cmd = Command::new(&self.ffmpeg_bin);
        cmd.args(["-y", "-loglevel", "error", "-f", "concat", "-safe", "0", "-i"])
            .arg(&list)
            .args(["-c", "copy"])
            .arg(&plan.output);
        process::run(TOOL, &mut cmd).await?;

        Ok(plan.output.clone())
    }
}

#[async_trait]
impl Compiler for FfmpegCompiler {
    async fn compile(&self, plan: &MontagePlan) -> Result<PathBuf> {
        if plan.clips.is_empty() {
            return Err(ClipError::invalid_input("montage plan has no clips"));
        }
        if let Some(bad) = plan.clips.iter().find(|c| !(c.end_ts > c.start_ts)) {
            return Err(ClipError::invalid_input(format!(
                "clip {:?} has empty range {}..{}",
                bad.source, bad.start_ts, bad.end_ts
            )));
        }

        let work = self.clips_dir.join(Ulid::new().to_string());
        tokio::fs::create_dir_all(&work).await?;

        let result = self.assemble(plan, &work).await;
        // Intermediate clips are scratch either way.
        let _ = tokio::fs::remove_dir_all(&work).await;

        let output = result?;
        info!("Montage written to {:?}", output);
        Ok(output)
    }
}

/// Concat demuxer list: one `file '<path>'` line per part, single quotes escaped.
fn concat_list(parts: &[PathBuf]) -> String {
    parts
        .iter()
        .map(|p| {
            let escaped = p.to_string_lossy().replace('\'', "'\\''");
            format!("file '{}'\n", escaped)
        })
        .collect()
}
