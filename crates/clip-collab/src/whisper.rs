//! whisper.cpp transcription with ffmpeg audio normalization.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

use clip_core::{ClipError, Result, SegmentDraft, Transcriber, TranscriptionConfig};

use crate::process;

const TOOL: &str = "transcriber";

/// Runs whisper.cpp on a mono 16 kHz WAV extracted from the media file.
pub struct WhisperTranscriber {
    whisper_bin: PathBuf,
    model_path: PathBuf,
    ffmpeg_bin: PathBuf,
    model_id: String,
}

impl WhisperTranscriber {
    pub fn new(config: &TranscriptionConfig) -> Self {
        let model_id = config
            .model_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "whisper".to_string());

        Self {
            whisper_bin: config.whisper_bin.clone(),
            model_path: config.model_path.clone(),
            ffmpeg_bin: config.ffmpeg_bin.clone(),
            model_id,
        }
    }

    /// Fail early with a specific message when the binary or model is absent.
    fn check_installed(&self) -> Result<()> {
        // Bare names are resolved through PATH at spawn time.
        if self.whisper_bin.components().count() > 1 && !self.whisper_bin.is_file() {
            return Err(ClipError::collaborator(
                TOOL,
                format!("whisper binary not found at {:?}", self.whisper_bin),
            ));
        }
        if !self.model_path.is_file() {
            return Err(ClipError::collaborator(
                TOOL,
                format!("whisper model not found at {:?}", self.model_path),
            ));
        }
        Ok(())
    }

    async fn normalize(&self, media: &Path, wav: &Path) -> Result<()> {
        let mut cmd = Command::new(&self.ffmpeg_bin);
        cmd.arg("-y")
            .arg("-loglevel")
            .arg("error")
            .arg("-i")
            .arg(media)
            .args(["-vn", "-ac", "1", "-ar", "16000", "-f", "wav"])
            .arg(wav);
        process::run(TOOL, &mut cmd).await.map_err(|e| {
            ClipError::collaborator(TOOL, format!("audio normalization failed: {}", e))
        })?;
        Ok(())
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, media: &Path) -> Result<Vec<SegmentDraft>> {
        self.check_installed()?;

        let scratch = tempfile::tempdir()?;
        let wav = scratch.path().join("audio.wav");
        self.normalize(media, &wav).await?;

        let out_base = scratch.path().join("transcript");
        let mut cmd = Command::new(&self.whisper_bin);
        cmd.arg(&wav)
            .arg("--model")
            .arg(&self.model_path)
            .arg("-oj")
            .arg("--output-file")
            .arg(&out_base);
        let output = process::run(TOOL, &mut cmd).await?;

        let out_json = out_base.with_extension("json");
        if !out_json.is_file() {
            return Err(ClipError::collaborator(
                TOOL,
                format!(
                    "no output file produced at {:?}; stdout: {}",
                    out_json,
                    process::tail(&output.stdout)
                ),
            ));
        }

        let raw = tokio::fs::read_to_string(&out_json).await?;
        let segments = parse_transcript_json(&raw)?;

        info!(
            segments = segments.len(),
            "Transcribed {:?}",
            media.file_name().unwrap_or_default()
        );
        Ok(segments)
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

#[derive(Deserialize)]
struct SecondsOutput {
    segments: Vec<SecondsSegment>,
}

#[derive(Deserialize)]
struct SecondsSegment {
    start: f64,
    end: f64,
    text: String,
}

#[derive(Deserialize)]
struct CppOutput {
    transcription: Vec<CppSegment>,
}

#[derive(Deserialize)]
struct CppSegment {
    offsets: CppOffsets,
    text: String,
}

#[derive(Deserialize)]
struct CppOffsets {
    from: u64,
    to: u64,
}

/// Parse whisper JSON output.
///
/// Accepts `{"segments": [{start, end, text}]}` with seconds, or whisper.cpp's
/// `{"transcription": [{"offsets": {from, to}, text}]}` with milliseconds.
/// Text is trimmed; a segment ending before it starts is rejected.
pub fn parse_transcript_json(raw: &str) -> Result<Vec<SegmentDraft>> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| ClipError::collaborator(TOOL, format!("unparsable output: {}", e)))?;

    let drafts: Vec<SegmentDraft> = if value.get("segments").is_some() {
        let parsed: SecondsOutput = serde_json::from_value(value)
            .map_err(|e| ClipError::collaborator(TOOL, format!("unparsable segments: {}", e)))?;
        parsed
            .segments
            .into_iter()
            .map(|s| SegmentDraft {
                start_ts: s.start,
                end_ts: s.end,
                text: s.text.trim().to_string(),
            })
            .collect()
    } else if value.get("transcription").is_some() {
        let parsed: CppOutput = serde_json::from_value(value).map_err(|e| {
            ClipError::collaborator(TOOL, format!("unparsable transcription: {}", e))
        })?;
        parsed
            .transcription
            .into_iter()
            .map(|s| SegmentDraft {
                start_ts: s.offsets.from as f64 / 1000.0,
                end_ts: s.offsets.to as f64 / 1000.0,
                text: s.text.trim().to_string(),
            })
            .collect()
    } else {
        return Err(ClipError::collaborator(
            TOOL,
            "output has neither 'segments' nor 'transcription'",
        ));
    };

    for (i, d) in drafts.iter().enumerate() {
        if !d.start_ts.is_finite() || !d.end_ts.is_finite() || d.end_ts < d.start_ts {
            return Err(ClipError::collaborator(
                TOOL,
                format!("segment {} ends before it starts ({}..{})", i, d.start_ts, d.end_ts),
            ));
        }
    }

    debug!(segments = drafts.len(), "Parsed transcript");
    Ok(drafts)
}
