//! Per-stage work: the collaborator call and the store write for one unit.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use ulid::Ulid;

use clip_core::{
    ClipError, CommitOutcome, ContradictionScorer, Embedder, FetchedMedia, Fetcher, Result,
    SegmentDraft, Stage, Store, Transcriber, WorkUnit,
};
use clip_store::ContentLedger;

/// One stage's unit processing, split so the coordinator can bound the
/// expensive half with a timeout and keep the write short.
#[async_trait]
pub trait StageHandler: Send + Sync {
    type Output: Send;

    fn stage(&self) -> Stage;

    /// Invoke the external collaborator for the unit.
    async fn compute(&self, unit: &WorkUnit) -> Result<Self::Output>;

    /// Persist the result in one transaction.
    async fn commit(&self, unit: &WorkUnit, output: Self::Output) -> Result<CommitOutcome>;
}

fn wrong_unit(stage: Stage, unit: &WorkUnit) -> ClipError {
    ClipError::internal(format!("{} handler received {}", stage, unit.key()))
}

/// A per-download scratch directory, removed with whatever it still holds
/// when dropped. Covers downloads abandoned by a timeout or a failed commit.
pub struct StagingDir {
    path: PathBuf,
}

impl StagingDir {
    async fn create(parent: &Path) -> Result<Self> {
        let path = parent.join(Ulid::new().to_string());
        tokio::fs::create_dir_all(&path).await?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove staging dir {:?}: {}", self.path, e),
        }
    }
}

/// A finished download and the scratch directory holding it.
pub struct Staged {
    media: FetchedMedia,
    _dir: StagingDir,
}

/// Downloads a source and commits it through the content ledger.
pub struct FetchHandler<S: ?Sized> {
    store: Arc<S>,
    fetcher: Arc<dyn Fetcher>,
    ledger: ContentLedger,
    staging_dir: PathBuf,
}

impl<S: Store + ?Sized> FetchHandler<S> {
    pub fn new(
        store: Arc<S>,
        fetcher: Arc<dyn Fetcher>,
        ledger: ContentLedger,
        staging_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            fetcher,
            ledger,
            staging_dir,
        }
    }
}

#[async_trait]
impl<S: Store + ?Sized> StageHandler for FetchHandler<S> {
    type Output = Staged;

    fn stage(&self) -> Stage {
        Stage::Fetch
    }

    async fn compute(&self, unit: &WorkUnit) -> Result<Staged> {
        let WorkUnit::Fetch { url, .. } = unit else {
            return Err(wrong_unit(self.stage(), unit));
        };

        let dir = StagingDir::create(&self.staging_dir).await?;
        let media = self.fetcher.fetch(url, dir.path()).await?;
        Ok(Staged { media, _dir: dir })
    }

    async fn commit(&self, unit: &WorkUnit, staged: Staged) -> Result<CommitOutcome> {
        let WorkUnit::Fetch { source_id, url } = unit else {
            return Err(wrong_unit(self.stage(), unit));
        };
        let media = staged.media;

        let commit = self
            .ledger
            .commit_file(self.store.as_ref(), &media.path, media.media_id)
            .await?;
        let link = self
            .store
            .link_source(*source_id, &commit.handle.fingerprint)
            .await?;

        if !commit.created {
            debug!(
                source_id,
                file = %commit.handle.fingerprint,
                "Source {} duplicates stored content", url
            );
            return Ok(CommitOutcome::Duplicate);
        }
        Ok(link)
    }
}

/// Transcribes a stored file and writes its full segment set.
pub struct TranscribeHandler<S: ?Sized> {
    store: Arc<S>,
    transcriber: Arc<dyn Transcriber>,
}

impl<S: Store + ?Sized> TranscribeHandler<S> {
    pub fn new(store: Arc<S>, transcriber: Arc<dyn Transcriber>) -> Self {
        Self { store, transcriber }
    }
}

#[async_trait]
impl<S: Store + ?Sized> StageHandler for TranscribeHandler<S> {
    type Output = Vec<SegmentDraft>;

    fn stage(&self) -> Stage {
        Stage::Transcribe
    }

    async fn compute(&self, unit: &WorkUnit) -> Result<Vec<SegmentDraft>> {
        let WorkUnit::Transcribe { path, .. } = unit else {
            return Err(wrong_unit(self.stage(), unit));
        };

        let drafts = self.transcriber.transcribe(path).await?;
        if let Some((i, _)) = drafts
            .iter()
            .enumerate()
            .find(|(_, d)| !d.start_ts.is_finite() || !d.end_ts.is_finite() || d.end_ts < d.start_ts)
        {
            return Err(ClipError::collaborator(
                "transcriber",
                format!("segment {} has an invalid time range", i),
            ));
        }
        Ok(drafts)
    }

    async fn commit(&self, unit: &WorkUnit, drafts: Vec<SegmentDraft>) -> Result<CommitOutcome> {
        let WorkUnit::Transcribe { fingerprint, .. } = unit else {
            return Err(wrong_unit(self.stage(), unit));
        };
        self.store
            .insert_transcript(fingerprint, &drafts, self.transcriber.model_id())
            .await
    }
}

/// Embeds one segment.
pub struct EmbedHandler<S: ?Sized> {
    store: Arc<S>,
    embedder: Arc<dyn Embedder>,
}

impl<S: Store + ?Sized> EmbedHandler<S> {
    pub fn new(store: Arc<S>, embedder: Arc<dyn Embedder>) -> Self {
        Self { store, embedder }
    }
}

#[async_trait]
impl<S: Store + ?Sized> StageHandler for EmbedHandler<S> {
    type Output = Vec<f32>;

    fn stage(&self) -> Stage {
        Stage::Embed
    }

    async fn compute(&self, unit: &WorkUnit) -> Result<Vec<f32>> {
        let WorkUnit::Embed { text, .. } = unit else {
            return Err(wrong_unit(self.stage(), unit));
        };

        let vector = self.embedder.embed(text).await?;
        if vector.len() != self.embedder.dimension() {
            return Err(ClipError::collaborator(
                "embedder",
                format!(
                    "vector has dimension {}, expected {}",
                    vector.len(),
                    self.embedder.dimension()
                ),
            ));
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(ClipError::collaborator("embedder", "vector contains non-finite values"));
        }
        Ok(vector)
    }

    async fn commit(&self, unit: &WorkUnit, vector: Vec<f32>) -> Result<CommitOutcome> {
        let WorkUnit::Embed { segment_id, .. } = unit else {
            return Err(wrong_unit(self.stage(), unit));
        };
        self.store
            .insert_embedding(*segment_id, &vector, self.embedder.model_id())
            .await
    }
}

/// Scores one cross-file segment pair.
pub struct DetectHandler<S: ?Sized> {
    store: Arc<S>,
    scorer: Arc<dyn ContradictionScorer>,
}

impl<S: Store + ?Sized> DetectHandler<S> {
    pub fn new(store: Arc<S>, scorer: Arc<dyn ContradictionScorer>) -> Self {
        Self { store, scorer }
    }
}

#[async_trait]
impl<S: Store + ?Sized> StageHandler for DetectHandler<S> {
    type Output = f32;

    fn stage(&self) -> Stage {
        Stage::Detect
    }

    async fn compute(&self, unit: &WorkUnit) -> Result<f32> {
        let WorkUnit::Detect { text_a, text_b, .. } = unit else {
            return Err(wrong_unit(self.stage(), unit));
        };

        let score = self.scorer.score(text_a, text_b).await?;
        if !score.is_finite() {
            return Err(ClipError::collaborator("scorer", format!("non-finite score {}", score)));
        }
        Ok(score)
    }

    async fn commit(&self, unit: &WorkUnit, score: f32) -> Result<CommitOutcome> {
        let WorkUnit::Detect { pair, .. } = unit else {
            return Err(wrong_unit(self.stage(), unit));
        };
        self.store.insert_contradiction(*pair, score).await
    }
}
