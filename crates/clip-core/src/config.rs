//! Configuration types for the clipper pipeline.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClipConfig {
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Media storage locations.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Worker pool settings.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Download tool settings.
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Speech recognition settings.
    #[serde(default)]
    pub transcription: TranscriptionConfig,

    /// Embedding model settings.
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Contradiction scoring settings.
    #[serde(default)]
    pub detection: DetectionConfig,

    /// Montage compilation settings.
    #[serde(default)]
    pub compile: CompileConfig,
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_database_path")]
    pub path: PathBuf,

    /// Enable WAL mode (required for concurrent writers).
    #[serde(default = "default_true")]
    pub wal_mode: bool,

    /// SQLite cache size in KB (negative = KB, positive = pages).
    #[serde(default = "default_cache_size")]
    pub cache_size: i32,

    /// Busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u32,

    /// Attempts for a transaction that hits a busy/locked database.
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,

    /// Backoff step between retries, multiplied by the attempt number.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            wal_mode: true,
            cache_size: -64000, // 64MB
            busy_timeout_ms: 30000,
            write_retries: 5,
            retry_backoff_ms: 50,
        }
    }
}

/// Where downloaded media lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Content-addressed media directory.
    #[serde(default = "default_media_dir")]
    pub media_dir: PathBuf,

    /// Scratch directory for in-flight downloads.
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            media_dir: default_media_dir(),
            staging_dir: default_staging_dir(),
        }
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Concurrent workers per stage.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Per-unit time budget for the external call.
    #[serde(default = "default_unit_timeout")]
    pub unit_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            unit_timeout_secs: 600,
        }
    }
}

/// yt-dlp configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_ytdlp_bin")]
    pub ytdlp_bin: PathBuf,

    /// Format selector passed to `-f`.
    #[serde(default = "default_format")]
    pub format: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            ytdlp_bin: default_ytdlp_bin(),
            format: default_format(),
        }
    }
}

/// whisper.cpp configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    #[serde(default = "default_whisper_bin")]
    pub whisper_bin: PathBuf,

    #[serde(default = "default_whisper_model")]
    pub model_path: PathBuf,

    /// ffmpeg used to normalize input to mono 16 kHz.
    #[serde(default = "default_ffmpeg_bin")]
    pub ffmpeg_bin: PathBuf,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            whisper_bin: default_whisper_bin(),
            model_path: default_whisper_model(),
            ffmpeg_bin: default_ffmpeg_bin(),
        }
    }
}

/// Which embedder implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    /// Deterministic hash embedding, no model files needed.
    Hash,
    /// ONNX sentence-embedding model.
    Onnx,
}

/// Embedding configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_backend")]
    pub backend: EmbeddingBackend,

    /// Path to ONNX model file.
    #[serde(default = "default_embedding_model")]
    pub model_path: PathBuf,

    /// Path to tokenizer.json.
    #[serde(default = "default_embedding_tokenizer")]
    pub tokenizer_path: PathBuf,

    #[serde(default = "default_dimension")]
    pub dimension: usize,

    /// Number of threads for CPU inference.
    #[serde(default = "default_num_threads")]
    pub num_threads: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::Hash,
            model_path: default_embedding_model(),
            tokenizer_path: default_embedding_tokenizer(),
            dimension: 384,
            num_threads: 4,
        }
    }
}

/// Contradiction scoring configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// ONNX NLI model. Detection is unavailable when unset.
    #[serde(default)]
    pub model_path: Option<PathBuf>,

    #[serde(default)]
    pub tokenizer_path: Option<PathBuf>,

    /// Index of the CONTRADICTION label in the model's logits.
    #[serde(default)]
    pub contradiction_label: usize,

    /// Selection keeps records scoring strictly above this.
    #[serde(default)]
    pub min_score: f32,

    #[serde(default = "default_num_threads")]
    pub num_threads: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            model_path: None,
            tokenizer_path: None,
            contradiction_label: 0,
            min_score: 0.0,
            num_threads: 4,
        }
    }
}

/// Montage compilation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileConfig {
    #[serde(default = "default_ffmpeg_bin")]
    pub ffmpeg_bin: PathBuf,

    #[serde(default = "default_output")]
    pub output: PathBuf,

    #[serde(default = "default_summary_output")]
    pub summary_output: PathBuf,

    /// Number of contradictions in the montage.
    #[serde(default = "default_top_n")]
    pub top_n: usize,

    /// Seconds per clip.
    #[serde(default = "default_clip_duration")]
    pub clip_duration: f64,

    /// Seconds of context before a segment starts.
    #[serde(default = "default_lead_in")]
    pub lead_in: f64,

    /// Directory for intermediate clips.
    #[serde(default = "default_clips_dir")]
    pub clips_dir: PathBuf,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            ffmpeg_bin: default_ffmpeg_bin(),
            output: default_output(),
            summary_output: default_summary_output(),
            top_n: 20,
            clip_duration: 15.0,
            lead_in: 2.0,
            clips_dir: default_clips_dir(),
        }
    }
}

// Default value functions

fn default_true() -> bool {
    true
}

fn default_cache_size() -> i32 {
    -64000
}

fn default_busy_timeout() -> u32 {
    30000
}

fn default_write_retries() -> u32 {
    5
}

fn default_retry_backoff() -> u64 {
    50
}

fn default_workers() -> usize {
    4
}

fn default_unit_timeout() -> u64 {
    600
}

fn default_num_threads() -> usize {
    4
}

fn default_dimension() -> usize {
    384
}

fn default_embedding_backend() -> EmbeddingBackend {
    EmbeddingBackend::Hash
}

fn default_top_n() -> usize {
    20
}

fn default_clip_duration() -> f64 {
    15.0
}

fn default_lead_in() -> f64 {
    2.0
}

fn default_format() -> String {
    "best".to_string()
}

fn default_ytdlp_bin() -> PathBuf {
    PathBuf::from("yt-dlp")
}

fn default_ffmpeg_bin() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_whisper_bin() -> PathBuf {
    PathBuf::from("./whisper")
}

fn default_whisper_model() -> PathBuf {
    PathBuf::from("models").join("ggml-base.en.bin")
}

fn default_output() -> PathBuf {
    PathBuf::from("output").join("contradiction_montage.mp4")
}

fn default_summary_output() -> PathBuf {
    PathBuf::from("output").join("contradictions.txt")
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("contradiction-clipper")
}

fn default_database_path() -> PathBuf {
    data_dir().join("clipper.db")
}

fn default_media_dir() -> PathBuf {
    data_dir().join("media")
}

fn default_staging_dir() -> PathBuf {
    data_dir().join("staging")
}

fn default_clips_dir() -> PathBuf {
    data_dir().join("clips")
}

fn default_embedding_model() -> PathBuf {
    data_dir()
        .join("models")
        .join("all-MiniLM-L6-v2")
        .join("model.onnx")
}

fn default_embedding_tokenizer() -> PathBuf {
    data_dir()
        .join("models")
        .join("all-MiniLM-L6-v2")
        .join("tokenizer.json")
}

impl ClipConfig {
    /// Load configuration from file.
    pub fn load(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            crate::error::ClipError::config(format!("Failed to parse config: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from default paths.
    pub fn load_default() -> crate::error::Result<Self> {
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir
                .join("contradiction-clipper")
                .join("config.toml");
            if user_config.exists() {
                return Self::load(&user_config);
            }
        }

        let local_config = PathBuf::from("clipper.toml");
        if local_config.exists() {
            return Self::load(&local_config);
        }

        Ok(Self::default())
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::ClipError;

        if self.pipeline.workers == 0 {
            return Err(ClipError::config("pipeline.workers must be at least 1"));
        }
        if self.pipeline.unit_timeout_secs == 0 {
            return Err(ClipError::config(
                "pipeline.unit_timeout_secs must be at least 1",
            ));
        }
        if !(self.compile.clip_duration > 0.0) {
            return Err(ClipError::config("compile.clip_duration must be positive"));
        }
        if self.compile.lead_in < 0.0 {
            return Err(ClipError::config("compile.lead_in must not be negative"));
        }
        if !self.detection.min_score.is_finite() {
            return Err(ClipError::config("detection.min_score must be finite"));
        }
        Ok(())
    }
}
