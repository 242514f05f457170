//! Stage-level entry points over a store and its collaborators.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tracing::{debug, info, warn};

use clip_core::{
    ClipConfig, ClipError, CompileConfig, Compiler, ContradictionDetail, ContradictionScorer,
    Embedder, ErrorKind, FailedUnit, Fetcher, Result, RunReport, SourceHandle, Stage, Store,
    Transcriber,
};
use clip_store::ContentLedger;

use crate::coordinator::Coordinator;
use crate::handlers::{DetectHandler, EmbedHandler, FetchHandler, StageHandler, TranscribeHandler};
use crate::montage::{plan_montage, render_summary};

/// External capabilities, each needed only by its own stage.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub fetcher: Option<Arc<dyn Fetcher>>,
    pub transcriber: Option<Arc<dyn Transcriber>>,
    pub embedder: Option<Arc<dyn Embedder>>,
    pub scorer: Option<Arc<dyn ContradictionScorer>>,
    pub compiler: Option<Arc<dyn Compiler>>,
}

impl Collaborators {
    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn with_transcriber(mut self, transcriber: Arc<dyn Transcriber>) -> Self {
        self.transcriber = Some(transcriber);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn ContradictionScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    pub fn with_compiler(mut self, compiler: Arc<dyn Compiler>) -> Self {
        self.compiler = Some(compiler);
        self
    }
}

fn require<T: ?Sized>(
    stage: Stage,
    collaborator: &'static str,
    slot: &Option<Arc<T>>,
) -> Result<Arc<T>> {
    slot.clone().ok_or_else(|| ClipError::MissingCollaborator {
        stage: stage.to_string(),
        collaborator,
    })
}

/// The pipeline: every stage is callable on its own, any number of times.
///
/// Each stage resolves its pending units from the store, so re-running a
/// stage after it finished is a no-op and re-running after failures
/// retries exactly the failed units.
pub struct Pipeline<S: Store + ?Sized + 'static> {
    store: Arc<S>,
    collaborators: Collaborators,
    coordinator: Coordinator,
    ledger: ContentLedger,
    staging_dir: PathBuf,
    compile: CompileConfig,
    min_score: f32,
}

impl<S: Store + ?Sized + 'static> Pipeline<S> {
    pub fn new(store: Arc<S>, collaborators: Collaborators, config: &ClipConfig) -> Self {
        Self {
            store,
            collaborators,
            coordinator: Coordinator::from_config(&config.pipeline),
            ledger: ContentLedger::new(&config.storage.media_dir),
            staging_dir: config.storage.staging_dir.clone(),
            compile: config.compile.clone(),
            min_score: config.detection.min_score,
        }
    }

    /// Replace the coordinator, e.g. to share claims or a cancel flag.
    pub fn with_coordinator(mut self, coordinator: Coordinator) -> Self {
        self.coordinator = coordinator;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.coordinator.cancel_flag()
    }

    /// Register URLs as Sources. Malformed URLs are returned as failures
    /// keyed `register:<url>`; the rest of the list is still registered.
    pub async fn register(&self, urls: &[String]) -> Result<(Vec<SourceHandle>, Vec<FailedUnit>)> {
        let mut sources = Vec::with_capacity(urls.len());
        let mut failed = Vec::new();

        for raw in urls {
            match self.store.register_source(raw).await {
                Ok(source) => sources.push(source),
                Err(e) if e.kind() == ErrorKind::InvalidInput => {
                    warn!("Skipping URL {:?}: {}", raw, e);
                    failed.push(FailedUnit {
                        key: format!("register:{}", raw),
                        code: e.error_code().to_string(),
                        message: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        sources.sort_by_key(|s| s.id);
        sources.dedup_by_key(|s| s.id);
        info!(
            "Registered {} sources ({} rejected)",
            sources.len(),
            failed.len()
        );
        Ok((sources, failed))
    }

    /// Register then fetch. Rejected URLs appear in the fetch report.
    pub async fn ingest(&self, urls: &[String]) -> Result<RunReport> {
        let (_, rejected) = self.register(urls).await?;
        self.fetch_with(rejected).await
    }

    /// Download every Source not yet linked to a File.
    pub async fn fetch(&self) -> Result<RunReport> {
        self.fetch_with(Vec::new()).await
    }

    async fn fetch_with(&self, prior: Vec<FailedUnit>) -> Result<RunReport> {
        let fetcher = require(Stage::Fetch, "fetcher", &self.collaborators.fetcher)?;
        let handler = FetchHandler::new(
            Arc::clone(&self.store),
            fetcher,
            self.ledger.clone(),
            self.staging_dir.clone(),
        );
        self.execute(handler, prior).await
    }

    /// Transcribe every File without a transcript.
    pub async fn transcribe(&self) -> Result<RunReport> {
        let transcriber = require(Stage::Transcribe, "transcriber", &self.collaborators.transcriber)?;
        let handler = TranscribeHandler::new(Arc::clone(&self.store), transcriber);
        self.execute(handler, Vec::new()).await
    }

    /// Embed every Segment without an Embedding.
    pub async fn embed(&self) -> Result<RunReport> {
        let embedder = require(Stage::Embed, "embedder", &self.collaborators.embedder)?;
        let handler = EmbedHandler::new(Arc::clone(&self.store), embedder);
        self.execute(handler, Vec::new()).await
    }

    /// Score every unscored cross-File pair, then settle finished file pairs.
    pub async fn detect(&self) -> Result<RunReport> {
        let scorer = require(Stage::Detect, "scorer", &self.collaborators.scorer)?;
        let handler = DetectHandler::new(Arc::clone(&self.store), scorer);
        let report = self.execute(handler, Vec::new()).await?;

        let settled = self.store.settle_comparisons().await?;
        if settled > 0 {
            debug!(settled, "Settled file pairs");
        }
        Ok(report)
    }

    /// Compile the configured top-N montage.
    pub async fn compile(&self) -> Result<RunReport> {
        let output = self.compile.output.clone();
        self.compile_to(self.compile.top_n, &output).await
    }

    /// Compile the top `top_n` contradictions above the score threshold into
    /// `output`. An empty selection is a warning, not an error. The compiler
    /// gets the same time bound as any single unit.
    pub async fn compile_to(&self, top_n: usize, output: &Path) -> Result<RunReport> {
        let compiler = require(Stage::Compile, "compiler", &self.collaborators.compiler)?;
        let mut report = RunReport::begin(Stage::Compile);

        let details = self.top(top_n).await?;
        if details.is_empty() {
            warn!(
                "No contradictions scored above {}, nothing to compile",
                self.min_score
            );
        } else {
            let plan = plan_montage(
                &details,
                output,
                self.compile.lead_in,
                self.compile.clip_duration,
            );
            info!(
                contradictions = details.len(),
                clips = plan.clips.len(),
                "Compiling montage"
            );
            let key = format!("compile:{}", output.display());
            let timeout = self.coordinator.unit_timeout();
            let outcome = match tokio::time::timeout(timeout, compiler.compile(&plan)).await {
                Ok(result) => result,
                Err(_) => Err(ClipError::Timeout {
                    unit: key.clone(),
                    seconds: timeout.as_secs(),
                }),
            };
            match outcome {
                Ok(path) => {
                    info!("Montage written to {:?}", path);
                    report.processed = 1;
                }
                Err(e) => {
                    warn!(code = e.error_code(), "Compile failed: {}", e);
                    report.failed.push(FailedUnit {
                        key,
                        code: e.error_code().to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        let report = report.finish();
        self.store.record_run(&report).await?;
        info!("{}", report);
        Ok(report)
    }

    /// Write the plain-text summary of the top `top_n` contradictions.
    /// Returns the number of lines written; writes nothing when there are none.
    pub async fn summarize(&self, path: &Path, top_n: usize) -> Result<usize> {
        let details = self.top(top_n).await?;
        if details.is_empty() {
            warn!("No contradictions scored above {}, no summary written", self.min_score);
            return Ok(0);
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(path, render_summary(&details)).await?;

        info!("Summary of {} contradictions written to {:?}", details.len(), path);
        Ok(details.len())
    }

    /// Top `n` contradictions above the score threshold, with both sides resolved.
    pub async fn top(&self, n: usize) -> Result<Vec<ContradictionDetail>> {
        let records = self.store.select_top_above(n, Some(self.min_score)).await?;
        self.store.contradiction_details(&records).await
    }

    /// Run one stage by name.
    pub async fn run_stage(&self, stage: Stage) -> Result<RunReport> {
        match stage {
            Stage::Fetch => self.fetch().await,
            Stage::Transcribe => self.transcribe().await,
            Stage::Embed => self.embed().await,
            Stage::Detect => self.detect().await,
            Stage::Compile => self.compile().await,
        }
    }

    /// Run the selected stages in pipeline order, stopping early on
    /// cancellation. A stage-level error aborts the remaining stages.
    pub async fn run_stages(&self, stages: &[Stage]) -> Result<Vec<RunReport>> {
        let mut reports = Vec::new();
        for stage in Stage::ALL.into_iter().filter(|s| stages.contains(s)) {
            if self.coordinator.is_cancelled() {
                warn!(stage = %stage, "Cancelled, not starting stage");
                break;
            }
            reports.push(self.run_stage(stage).await?);
        }
        Ok(reports)
    }

    async fn execute<H>(&self, handler: H, prior: Vec<FailedUnit>) -> Result<RunReport>
    where
        H: StageHandler + 'static,
    {
        let stage = handler.stage();
        let units = self.store.pending(stage).await?;
        debug!(stage = %stage, pending = units.len(), "Resolved pending units");

        let mut report = self
            .coordinator
            .run(Arc::clone(&self.store), Arc::new(handler), units)
            .await;
        if !prior.is_empty() {
            let mut failed = prior;
            failed.append(&mut report.failed);
            report.failed = failed;
        }

        self.store.record_run(&report).await?;
        Ok(report)
    }
}
