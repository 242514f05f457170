//! Core traits defining the interfaces between components.
//!
//! `Store` is the persistence seam; the remaining traits are the external
//! collaborators the pipeline invokes but does not specify.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::Result;
use crate::report::RunReport;
use crate::types::{
    CommitOutcome, ContradictionDetail, ContradictionRecord, FetchedMedia, FileCommit,
    FileHandle, Fingerprint, MontagePlan, PairKey, Segment, SegmentDraft, SegmentId,
    SourceHandle, Stage, StoreStats, WorkUnit,
};

/// Storage layer trait.
///
/// Every write that establishes a unique-keyed row reports `CommitOutcome::Duplicate`
/// instead of failing when the row already exists.
#[async_trait]
pub trait Store: Send + Sync {
    async fn schema_version(&self) -> Result<u32>;

    // Source registry
    async fn register_source(&self, url: &str) -> Result<SourceHandle>;
    async fn get_source(&self, id: i64) -> Result<Option<SourceHandle>>;
    async fn list_sources(&self) -> Result<Vec<SourceHandle>>;
    async fn link_source(&self, source_id: i64, file: &Fingerprint) -> Result<CommitOutcome>;

    // Content ledger
    async fn insert_file(&self, file: &FileHandle) -> Result<FileCommit>;
    async fn get_file(&self, fingerprint: &Fingerprint) -> Result<Option<FileHandle>>;

    // Segment store
    async fn insert_transcript(
        &self,
        file: &Fingerprint,
        segments: &[SegmentDraft],
        model: &str,
    ) -> Result<CommitOutcome>;
    async fn segments_for_file(&self, file: &Fingerprint) -> Result<Vec<Segment>>;

    // Embedding store
    async fn insert_embedding(
        &self,
        segment_id: SegmentId,
        vector: &[f32],
        model: &str,
    ) -> Result<CommitOutcome>;
    async fn get_embedding(&self, segment_id: SegmentId) -> Result<Option<Vec<f32>>>;

    // Contradiction ledger
    async fn insert_contradiction(&self, pair: PairKey, score: f32) -> Result<CommitOutcome>;
    async fn get_contradiction(&self, pair: PairKey) -> Result<Option<ContradictionRecord>>;

    /// Mark file pairs whose every cross pair has been scored.
    async fn settle_comparisons(&self) -> Result<u64>;

    // Stage resolver

    /// Units for `stage` lacking a completed output record.
    async fn pending(&self, stage: Stage) -> Result<Vec<WorkUnit>>;

    /// Whether the unit's output already exists.
    async fn is_complete(&self, unit: &WorkUnit) -> Result<bool>;

    // Selection & ordering

    /// Top `n` records with score strictly above `min_score` (all when `None`),
    /// ordered by score desc then pair ascending.
    async fn select_top_above(
        &self,
        n: usize,
        min_score: Option<f32>,
    ) -> Result<Vec<ContradictionRecord>>;

    async fn select_top(&self, n: usize) -> Result<Vec<ContradictionRecord>> {
        self.select_top_above(n, None).await
    }

    /// Resolve segments and files for each record, preserving order.
    async fn contradiction_details(
        &self,
        records: &[ContradictionRecord],
    ) -> Result<Vec<ContradictionDetail>>;

    // Bookkeeping
    async fn record_run(&self, report: &RunReport) -> Result<()>;
    async fn stats(&self) -> Result<StoreStats>;
}

/// Downloads a source into a staging directory.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, staging_dir: &Path) -> Result<FetchedMedia>;
}

/// Speech recognition: media file in, ordered timestamped text out.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, media: &Path) -> Result<Vec<SegmentDraft>>;

    /// Identifier of the model in use, recorded with each transcript.
    fn model_id(&self) -> &str;
}

/// Embedding model trait.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed one segment text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Get the embedding dimension.
    fn dimension(&self) -> usize;

    fn model_id(&self) -> &str;
}

/// Natural-language-inference scorer.
#[async_trait]
pub trait ContradictionScorer: Send + Sync {
    /// Probability-like score that `text_a` and `text_b` contradict.
    async fn score(&self, text_a: &str, text_b: &str) -> Result<f32>;

    fn model_id(&self) -> &str;
}

/// Media editing: cuts and concatenates the planned clips.
#[async_trait]
pub trait Compiler: Send + Sync {
    async fn compile(&self, plan: &MontagePlan) -> Result<PathBuf>;
}
