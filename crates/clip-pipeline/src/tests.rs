//! End-to-end stage scenarios against a file-backed store and fake collaborators.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use ulid::Ulid;

use clip_collab::HashEmbedder;
use clip_core::{
    ClipConfig, ClipError, Compiler, ContradictionScorer, FetchedMedia, Fetcher, MontagePlan,
    Result, SegmentDraft, Stage, Store, Transcriber,
};
use clip_store::SqliteStore;

use crate::{Collaborators, Coordinator, Pipeline};

/// Serves fixed bodies per canonical URL; hangs after staging a body containing "stall".
struct FakeFetcher {
    bodies: HashMap<String, String>,
    calls: AtomicUsize,
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch(&self, url: &str, staging_dir: &Path) -> Result<FetchedMedia> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let body = self
            .bodies
            .get(url)
            .ok_or_else(|| ClipError::collaborator("fetcher", format!("no such video: {}", url)))?;

        tokio::fs::create_dir_all(staging_dir).await?;
        let path = staging_dir.join(format!("{}.mp4", Ulid::new()));
        tokio::fs::write(&path, body).await?;
        if body.contains("stall") {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }

        Ok(FetchedMedia {
            path,
            media_id: url.rsplit('/').next().map(str::to_string),
        })
    }
}

/// One segment per line of the file, five seconds apart.
#[derive(Default)]
struct FakeTranscriber {
    calls: AtomicUsize,
    delay: Duration,
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, media: &Path) -> Result<Vec<SegmentDraft>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;

        let text = tokio::fs::read_to_string(media).await?;
        if text.contains("corrupt") {
            return Err(ClipError::collaborator("transcriber", "non-zero exit: invalid data"));
        }

        Ok(text
            .lines()
            .enumerate()
            .map(|(i, line)| SegmentDraft {
                start_ts: i as f64 * 5.0,
                end_ts: i as f64 * 5.0 + 4.0,
                text: line.to_string(),
            })
            .collect())
    }

    fn model_id(&self) -> &str {
        "fake-asr"
    }
}

/// Deterministic score with plenty of ties; hangs on texts containing "stall".
#[derive(Default)]
struct FakeScorer {
    calls: AtomicUsize,
}

#[async_trait]
impl ContradictionScorer for FakeScorer {
    async fn score(&self, text_a: &str, text_b: &str) -> Result<f32> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if text_a.contains("stall") || text_b.contains("stall") {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        Ok(((text_a.len() + text_b.len()) % 4) as f32 / 4.0 + 0.1)
    }

    fn model_id(&self) -> &str {
        "fake-nli"
    }
}

struct HangingCompiler;

#[async_trait]
impl Compiler for HangingCompiler {
    async fn compile(&self, plan: &MontagePlan) -> Result<PathBuf> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(plan.output.clone())
    }
}

#[derive(Default)]
struct RecordingCompiler {
    plans: Mutex<Vec<MontagePlan>>,
}

#[async_trait]
impl Compiler for RecordingCompiler {
    async fn compile(&self, plan: &MontagePlan) -> Result<PathBuf> {
        self.plans.lock().unwrap().push(plan.clone());
        Ok(plan.output.clone())
    }
}

struct Fixture {
    dir: TempDir,
    config: ClipConfig,
    store: Arc<SqliteStore>,
    urls: Vec<String>,
    fetcher: Arc<FakeFetcher>,
    transcriber: Arc<FakeTranscriber>,
    scorer: Arc<FakeScorer>,
    compiler: Arc<RecordingCompiler>,
}

impl Fixture {
    /// `videos` pairs a path under https://videos.example.com/ with its body.
    fn new(videos: &[(&str, &str)]) -> Self {
        let dir = tempfile::tempdir().unwrap();

        let mut config = ClipConfig::default();
        config.database.path = dir.path().join("clipper.db");
        config.storage.media_dir = dir.path().join("media");
        config.storage.staging_dir = dir.path().join("staging");
        config.compile.clips_dir = dir.path().join("clips");
        config.pipeline.workers = 4;

        let store = Arc::new(SqliteStore::open(&config.database.path).unwrap());

        let urls: Vec<String> = videos
            .iter()
            .map(|(id, _)| format!("https://videos.example.com/{}", id))
            .collect();
        let bodies = urls
            .iter()
            .cloned()
            .zip(videos.iter().map(|(_, body)| body.to_string()))
            .collect();

        Self {
            dir,
            config,
            store,
            urls,
            fetcher: Arc::new(FakeFetcher {
                bodies,
                calls: AtomicUsize::new(0),
            }),
            transcriber: Arc::new(FakeTranscriber::default()),
            scorer: Arc::new(FakeScorer::default()),
            compiler: Arc::new(RecordingCompiler::default()),
        }
    }

    fn collaborators(&self) -> Collaborators {
        Collaborators::default()
            .with_fetcher(self.fetcher.clone())
            .with_transcriber(self.transcriber.clone())
            .with_embedder(Arc::new(HashEmbedder::new()))
            .with_scorer(self.scorer.clone())
            .with_compiler(self.compiler.clone())
    }

    fn pipeline(&self) -> Pipeline<SqliteStore> {
        Pipeline::new(Arc::clone(&self.store), self.collaborators(), &self.config)
    }

    /// Run every per-unit stage once.
    async fn through_detect(&self, pipeline: &Pipeline<SqliteStore>) {
        pipeline.ingest(&self.urls).await.unwrap();
        for stage in [Stage::Transcribe, Stage::Embed, Stage::Detect] {
            let report = pipeline.run_stage(stage).await.unwrap();
            assert!(report.is_clean(), "{}", report);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_identical_content_shares_one_file() {
    let fx = Fixture::new(&[
        ("mirror-1", "taxes will go down\nwe love trade"),
        ("mirror-2", "taxes will go down\nwe love trade"),
        ("other", "taxes will go up"),
    ]);
    let pipeline = fx.pipeline();

    let fetch = pipeline.ingest(&fx.urls).await.unwrap();
    assert_eq!(fetch.processed, 2);
    assert_eq!(fetch.skipped, 1);
    assert!(fetch.failed.is_empty());

    let transcribe = pipeline.transcribe().await.unwrap();
    assert_eq!(transcribe.processed, 2);
    assert_eq!(fx.transcriber.calls.load(Ordering::SeqCst), 2);

    let sources = fx.store.list_sources().await.unwrap();
    assert_eq!(sources.len(), 3);
    assert_eq!(sources[0].file, sources[1].file);
    assert_ne!(sources[0].file, sources[2].file);

    let shared = sources[0].file.unwrap();
    assert_eq!(fx.store.segments_for_file(&shared).await.unwrap().len(), 2);

    let stats = fx.store.stats().await.unwrap();
    assert_eq!(stats.sources, 3);
    assert_eq!(stats.files, 2);
    assert_eq!(stats.segments, 3);

    // Staged copies were all moved or discarded.
    let mut staging = tokio::fs::read_dir(&fx.config.storage.staging_dir).await.unwrap();
    assert!(staging.next_entry().await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rerunning_stages_adds_nothing() {
    let fx = Fixture::new(&[
        ("a", "the economy is growing\nunemployment is low"),
        ("b", "the economy is shrinking"),
    ]);
    let pipeline = fx.pipeline();
    fx.through_detect(&pipeline).await;

    let before = fx.store.stats().await.unwrap();
    let calls = (
        fx.fetcher.calls.load(Ordering::SeqCst),
        fx.transcriber.calls.load(Ordering::SeqCst),
        fx.scorer.calls.load(Ordering::SeqCst),
    );

    pipeline.ingest(&fx.urls).await.unwrap();
    for stage in [Stage::Fetch, Stage::Transcribe, Stage::Embed, Stage::Detect] {
        let report = pipeline.run_stage(stage).await.unwrap();
        assert_eq!(report.total(), 0, "{}", report);
    }

    assert_eq!(fx.store.stats().await.unwrap(), before);
    assert_eq!(
        calls,
        (
            fx.fetcher.calls.load(Ordering::SeqCst),
            fx.transcriber.calls.load(Ordering::SeqCst),
            fx.scorer.calls.load(Ordering::SeqCst),
        )
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_detect_scores_every_cross_file_pair_once() {
    let fx = Fixture::new(&[
        ("two", "one fish\ntwo fish"),
        ("three", "red fish\nblue fish\nold fish"),
        ("one", "new fish"),
    ]);
    let pipeline = fx.pipeline();
    fx.through_detect(&pipeline).await;

    let stats = fx.store.stats().await.unwrap();
    assert_eq!(stats.contradictions, 2 * 3 + 2 * 1 + 3 * 1);
    assert_eq!(stats.settled_file_pairs, 3);
    assert_eq!(fx.scorer.calls.load(Ordering::SeqCst), 11);
    assert!(fx.store.pending(Stage::Detect).await.unwrap().is_empty());

    // A new File is only compared against the existing ones.
    let late = "https://videos.example.com/late".to_string();
    let fetcher: Arc<dyn Fetcher> = Arc::new(FakeFetcher {
        bodies: [(late.clone(), "a fish\nno fish".to_string())].into_iter().collect(),
        calls: AtomicUsize::new(0),
    });
    let pipeline = Pipeline::new(
        Arc::clone(&fx.store),
        fx.collaborators().with_fetcher(fetcher),
        &fx.config,
    );
    pipeline.ingest(&[late]).await.unwrap();
    pipeline.transcribe().await.unwrap();
    pipeline.embed().await.unwrap();

    let detect = pipeline.detect().await.unwrap();
    assert_eq!(detect.processed, 2 * (2 + 3 + 1));
    assert_eq!(fx.store.stats().await.unwrap().settled_file_pairs, 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_selection_is_deterministic() {
    let fx = Fixture::new(&[
        ("a", "we cut spending\nwe raised taxes\nwe built roads"),
        ("b", "spending went up\ntaxes were cut"),
        ("c", "no roads were built\nall is well"),
    ]);
    let pipeline = fx.pipeline();
    fx.through_detect(&pipeline).await;

    let first = fx.store.select_top(5).await.unwrap();
    let second = fx.store.select_top(5).await.unwrap();
    assert_eq!(first.len(), 5);
    assert_eq!(first, second);

    let all = fx.store.select_top(100).await.unwrap();
    assert_eq!(all.len(), 16);
    for w in all.windows(2) {
        assert!(
            w[0].score > w[1].score || (w[0].score == w[1].score && w[0].pair < w[1].pair),
            "{:?} before {:?}",
            w[0],
            w[1]
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_runs_transcribe_each_file_once() {
    let mut fx = Fixture::new(&[
        ("a", "first clip\nsecond clip"),
        ("b", "third clip"),
        ("c", "fourth clip\nfifth clip\nsixth clip"),
    ]);
    fx.transcriber = Arc::new(FakeTranscriber {
        calls: AtomicUsize::new(0),
        delay: Duration::from_millis(200),
    });
    let pipeline = fx.pipeline();
    pipeline.ingest(&fx.urls).await.unwrap();

    let (r1, r2) = tokio::join!(pipeline.transcribe(), pipeline.transcribe());
    let (r1, r2) = (r1.unwrap(), r2.unwrap());

    assert_eq!(r1.processed + r2.processed, 3);
    assert!(r1.failed.is_empty() && r2.failed.is_empty());
    assert_eq!(fx.transcriber.calls.load(Ordering::SeqCst), 3);
    assert_eq!(fx.store.stats().await.unwrap().segments, 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_stores_commit_each_transcript_once() {
    let fx = Fixture::new(&[("a", "first clip\nsecond clip"), ("b", "third clip")]);
    fx.pipeline().ingest(&fx.urls).await.unwrap();

    // Separate connections and coordinators: nothing shared but the database.
    let other_store = Arc::new(SqliteStore::open(&fx.config.database.path).unwrap());
    let one = fx.pipeline();
    let two = Pipeline::new(other_store, fx.collaborators(), &fx.config);

    let (r1, r2) = tokio::join!(one.transcribe(), two.transcribe());
    let (r1, r2) = (r1.unwrap(), r2.unwrap());

    assert_eq!(r1.processed + r2.processed, 2);
    assert!(r1.failed.is_empty() && r2.failed.is_empty());
    let stats = fx.store.stats().await.unwrap();
    assert_eq!(stats.transcribed_files, 2);
    assert_eq!(stats.segments, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_unit_stays_pending() {
    let fx = Fixture::new(&[
        ("good-1", "all good here"),
        ("bad", "corrupt stream"),
        ("good-2", "fine as well\nreally"),
    ]);
    let pipeline = fx.pipeline();
    pipeline.ingest(&fx.urls).await.unwrap();

    let report = pipeline.transcribe().await.unwrap();
    assert_eq!(report.processed, 2);
    assert_eq!(report.failed.len(), 1);
    assert!(report.failed[0].key.starts_with("transcribe:"));
    assert_eq!(report.failed[0].code, "COLLABORATOR_FAILURE");

    // The failure is retried on the next run, not skipped.
    let again = pipeline.transcribe().await.unwrap();
    assert_eq!(again.processed, 0);
    assert_eq!(again.failed.len(), 1);
    assert_eq!(fx.store.pending(Stage::Transcribe).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hung_scorer_times_out_per_unit() {
    let fx = Fixture::new(&[("a", "please stall\nquick one"), ("b", "another quick one")]);
    let pipeline = fx
        .pipeline()
        .with_coordinator(Coordinator::new(2, Duration::from_millis(200)));
    pipeline.ingest(&fx.urls).await.unwrap();
    pipeline.transcribe().await.unwrap();
    pipeline.embed().await.unwrap();

    let detect = pipeline.detect().await.unwrap();
    assert_eq!(detect.processed, 1);
    assert_eq!(detect.failed.len(), 1);
    assert_eq!(detect.failed[0].code, "UNIT_TIMEOUT");

    // The pair is unscored, so its file pair is not settled.
    let stats = fx.store.stats().await.unwrap();
    assert_eq!(stats.settled_file_pairs, 0);
    assert_eq!(fx.store.pending(Stage::Detect).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_cancelled_pipeline_starts_nothing() {
    let fx = Fixture::new(&[("a", "some words")]);
    let pipeline = fx.pipeline();
    pipeline.register(&fx.urls).await.unwrap();

    pipeline.cancel_flag().store(true, Ordering::SeqCst);

    let fetch = pipeline.fetch().await.unwrap();
    assert!(fetch.interrupted);
    assert_eq!(fetch.processed, 0);
    assert_eq!(fx.fetcher.calls.load(Ordering::SeqCst), 0);

    let reports = pipeline.run_stages(&Stage::ALL).await.unwrap();
    assert!(reports.is_empty());
    assert_eq!(fx.store.pending(Stage::Fetch).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_missing_collaborator_only_fails_its_stage() {
    let fx = Fixture::new(&[("a", "some words")]);
    let pipeline = Pipeline::new(Arc::clone(&fx.store), Collaborators::default(), &fx.config);

    let (sources, rejected) = pipeline.register(&fx.urls).await.unwrap();
    assert_eq!(sources.len(), 1);
    assert!(rejected.is_empty());

    let err = pipeline.fetch().await.unwrap_err();
    assert_eq!(err.error_code(), "MISSING_COLLABORATOR");
    assert!(err.to_string().contains("fetcher"));

    let err = pipeline.compile().await.unwrap_err();
    assert_eq!(err.error_code(), "MISSING_COLLABORATOR");
}

#[tokio::test]
async fn test_invalid_urls_reported_per_item() {
    let fx = Fixture::new(&[("a", "some words")]);
    let pipeline = fx.pipeline();

    let mut urls = vec!["not a url".to_string(), "ftp://videos.example.com/x".to_string()];
    urls.extend(fx.urls.iter().cloned());
    urls.push(format!("{}#t=30", fx.urls[0]));

    let report = pipeline.ingest(&urls).await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.failed.len(), 2);
    assert!(report.failed.iter().all(|f| f.key.starts_with("register:")));
    assert_eq!(fx.store.stats().await.unwrap().sources, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_compile_plan_and_summary() {
    let fx = Fixture::new(&[
        ("speech-1", "we will build it\nit is finished"),
        ("speech-2", "we will never build it"),
    ]);
    let pipeline = fx.pipeline();
    fx.through_detect(&pipeline).await;

    let output = fx.dir.path().join("out").join("montage.mp4");
    let report = pipeline.compile_to(2, &output).await.unwrap();
    assert_eq!(report.processed, 1);
    assert!(report.is_clean());

    let plans = fx.compiler.plans.lock().unwrap().clone();
    assert_eq!(plans.len(), 1);
    let plan = &plans[0];
    assert_eq!(plan.output, output);
    assert_eq!(plan.clips.len(), 4);
    assert_eq!(plan.clips[0].rank, 0);
    assert_eq!(plan.clips[3].rank, 1);
    assert!(plan.clips.iter().all(|c| c.start_ts >= 0.0 && c.end_ts > c.start_ts));
    assert!(plan.clips.iter().all(|c| c.source.starts_with(&fx.config.storage.media_dir)));

    let summary_path = fx.dir.path().join("out").join("summary.txt");
    let written = pipeline.summarize(&summary_path, 10).await.unwrap();
    assert_eq!(written, 2);
    let text = tokio::fs::read_to_string(&summary_path).await.unwrap();
    assert_eq!(text.lines().count(), 2);
    assert!(text.lines().all(|l| l.starts_with("In video speech-")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_nothing_above_threshold_compiles_nothing() {
    let mut fx = Fixture::new(&[("a", "yes"), ("b", "no")]);
    fx.config.detection.min_score = 0.95;
    let pipeline = fx.pipeline();
    fx.through_detect(&pipeline).await;

    let report = pipeline.compile().await.unwrap();
    assert_eq!(report.processed, 0);
    assert!(report.failed.is_empty());
    assert!(fx.compiler.plans.lock().unwrap().is_empty());

    let summary_path = fx.dir.path().join("summary.txt");
    assert_eq!(pipeline.summarize(&summary_path, 10).await.unwrap(), 0);
    assert!(!summary_path.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_abandoned_download_leaves_no_staged_file() {
    let fx = Fixture::new(&[("slow", "stall forever"), ("quick", "fine")]);
    let pipeline = fx
        .pipeline()
        .with_coordinator(Coordinator::new(2, Duration::from_millis(200)));

    let report = pipeline.ingest(&fx.urls).await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].code, "UNIT_TIMEOUT");

    let mut staging = tokio::fs::read_dir(&fx.config.storage.staging_dir).await.unwrap();
    assert!(staging.next_entry().await.unwrap().is_none());
    assert_eq!(fx.store.pending(Stage::Fetch).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hung_compiler_times_out() {
    let fx = Fixture::new(&[("a", "it is raining"), ("b", "it is dry")]);
    let pipeline = Pipeline::new(
        Arc::clone(&fx.store),
        fx.collaborators().with_compiler(Arc::new(HangingCompiler)),
        &fx.config,
    )
    .with_coordinator(Coordinator::new(2, Duration::from_millis(200)));
    fx.through_detect(&pipeline).await;

    let output = fx.dir.path().join("montage.mp4");
    let report = pipeline.compile_to(1, &output).await.unwrap();
    assert_eq!(report.processed, 0);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].code, "UNIT_TIMEOUT");
    assert!(report.failed[0].key.starts_with("compile:"));
}
