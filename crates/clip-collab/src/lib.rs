//! clip-collab - External collaborators for the clipper pipeline
//!
//! Each type here implements one of the `clip-core` collaborator traits by
//! wrapping an external tool or model:
//!
//! - `YtDlpFetcher` downloads sources with yt-dlp
//! - `WhisperTranscriber` normalizes audio with ffmpeg and runs whisper.cpp
//! - `OnnxEmbedder` and `HashEmbedder` produce segment embeddings
//! - `OnnxNliScorer` scores segment pairs with an NLI model
//! - `FfmpegCompiler` cuts and concatenates the montage

mod ffmpeg;
mod mock;
mod nli;
mod onnx;
mod process;
mod whisper;
mod ytdlp;

pub use ffmpeg::FfmpegCompiler;
pub use mock::HashEmbedder;
pub use nli::OnnxNliScorer;
pub use onnx::OnnxEmbedder;
pub use whisper::{parse_transcript_json, WhisperTranscriber};
pub use ytdlp::YtDlpFetcher;

// Re-export the collaborator traits for convenience
pub use clip_core::{Compiler, ContradictionScorer, Embedder, Fetcher, Transcriber};
