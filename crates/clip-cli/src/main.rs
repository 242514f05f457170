//! clipper CLI - run the contradiction-clipper pipeline stage by stage.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use clip_collab::{
    FfmpegCompiler, HashEmbedder, OnnxEmbedder, OnnxNliScorer, WhisperTranscriber, YtDlpFetcher,
};
use clip_core::{ClipConfig, EmbeddingBackend, RunReport, Stage, Store};
use clip_pipeline::{format_summary_line, Collaborators, Pipeline};
use clip_store::SqliteStore;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// clipper - find and compile contradictions across a list of videos
#[derive(Parser)]
#[command(name = "clipper")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Database path (overrides the config file)
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Config file (default: ~/.config/contradiction-clipper/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Concurrent workers per stage (overrides the config file)
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    /// Print reports and listings as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database and media directories
    Init,

    /// Register the URLs in a list file and download them
    Ingest {
        /// One URL per line; blank lines and lines starting with '#' are ignored
        list: PathBuf,
    },

    /// Download registered sources not yet fetched
    Fetch,

    /// Transcribe stored files
    Transcribe,

    /// Embed transcript segments
    Embed,

    /// Score cross-video segment pairs
    Detect,

    /// Compile the top contradictions into a montage
    Compile {
        /// Number of contradictions to include
        #[arg(short = 'n', long)]
        top_n: Option<usize>,

        /// Output video path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Write a plain-text summary of the top contradictions
    Summary {
        /// Output path
        path: Option<PathBuf>,

        /// Number of contradictions to include
        #[arg(short = 'n', long)]
        top_n: Option<usize>,
    },

    /// Run several stages in pipeline order
    Run {
        /// Comma-separated stages
        #[arg(
            long,
            value_delimiter = ',',
            default_value = "fetch,transcribe,embed,detect,compile"
        )]
        stages: Vec<Stage>,
    },

    /// Show the top contradictions
    Top {
        /// Number of contradictions to show
        #[arg(short = 'n', long, default_value = "10")]
        n: usize,
    },

    /// Show store statistics
    Stats,
}

impl Commands {
    /// Stages whose collaborators the command needs.
    fn stages(&self) -> Vec<Stage> {
        match self {
            Self::Ingest { .. } | Self::Fetch => vec![Stage::Fetch],
            Self::Transcribe => vec![Stage::Transcribe],
            Self::Embed => vec![Stage::Embed],
            Self::Detect => vec![Stage::Detect],
            Self::Compile { .. } => vec![Stage::Compile],
            Self::Run { stages } => stages.clone(),
            Self::Init | Self::Summary { .. } | Self::Top { .. } | Self::Stats => Vec::new(),
        }
    }
}

fn setup_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
}

fn load_config(cli: &Cli) -> CliResult<ClipConfig> {
    let mut config = match &cli.config {
        Some(path) => ClipConfig::load(path)?,
        None => ClipConfig::load_default()?,
    };
    if let Some(path) = &cli.database {
        config.database.path = path.clone();
    }
    if let Some(workers) = cli.workers {
        config.pipeline.workers = workers;
    }
    config.validate()?;
    Ok(config)
}

/// Build only the collaborators the requested stages use, so a missing
/// model for one stage does not block the others.
fn build_collaborators(config: &ClipConfig, stages: &[Stage]) -> CliResult<Collaborators> {
    let mut collaborators = Collaborators::default();

    for stage in stages {
        collaborators = match stage {
            Stage::Fetch => {
                collaborators.with_fetcher(Arc::new(YtDlpFetcher::new(&config.fetch)))
            }
            Stage::Transcribe => collaborators
                .with_transcriber(Arc::new(WhisperTranscriber::new(&config.transcription))),
            Stage::Embed => match config.embedding.backend {
                EmbeddingBackend::Hash => collaborators.with_embedder(Arc::new(
                    HashEmbedder::with_dimension(config.embedding.dimension),
                )),
                EmbeddingBackend::Onnx => {
                    collaborators.with_embedder(Arc::new(OnnxEmbedder::new(&config.embedding)?))
                }
            },
            // Without a model the stage reports the missing scorer when invoked.
            Stage::Detect => match config.detection.model_path {
                Some(_) => {
                    collaborators.with_scorer(Arc::new(OnnxNliScorer::new(&config.detection)?))
                }
                None => collaborators,
            },
            Stage::Compile => {
                collaborators.with_compiler(Arc::new(FfmpegCompiler::new(&config.compile)))
            }
        };
    }

    Ok(collaborators)
}

fn open_store(config: &ClipConfig) -> CliResult<SqliteStore> {
    if let Some(parent) = config.database.path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            eprintln!(
                "Database directory does not exist. Run 'clipper init' first, or specify a path with -d."
            );
            std::process::exit(1);
        }
    }
    Ok(SqliteStore::open_with_config(&config.database)?)
}

#[tokio::main]
async fn main() -> CliResult<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let config = load_config(&cli)?;

    if let Commands::Init = cli.command {
        return init(&config).await;
    }

    let store = Arc::new(open_store(&config)?);
    let collaborators = build_collaborators(&config, &cli.command.stages())?;
    let pipeline = Pipeline::new(Arc::clone(&store), collaborators, &config);

    let cancel = pipeline.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight units");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    match cli.command {
        Commands::Init => {}
        Commands::Ingest { list } => {
            let urls = read_url_list(&list)?;
            info!("Read {} URLs from {}", urls.len(), list.display());
            let report = pipeline.ingest(&urls).await?;
            print_reports(&[report], cli.json)?;
        }
        Commands::Fetch => print_reports(&[pipeline.fetch().await?], cli.json)?,
        Commands::Transcribe => print_reports(&[pipeline.transcribe().await?], cli.json)?,
        Commands::Embed => print_reports(&[pipeline.embed().await?], cli.json)?,
        Commands::Detect => print_reports(&[pipeline.detect().await?], cli.json)?,
        Commands::Compile { top_n, output } => {
            let top_n = top_n.unwrap_or(config.compile.top_n);
            let output = output.unwrap_or_else(|| config.compile.output.clone());
            let report = pipeline.compile_to(top_n, &output).await?;
            print_reports(&[report], cli.json)?;
        }
        Commands::Summary { path, top_n } => {
            let path = path.unwrap_or_else(|| config.compile.summary_output.clone());
            let top_n = top_n.unwrap_or(config.compile.top_n);
            let written = pipeline.summarize(&path, top_n).await?;
            if written > 0 {
                println!("Wrote {} contradictions to {}", written, path.display());
            } else {
                println!("No contradictions to summarize");
            }
        }
        Commands::Run { stages } => {
            let reports = pipeline.run_stages(&stages).await?;
            print_reports(&reports, cli.json)?;
        }
        Commands::Top { n } => top(&pipeline, n, cli.json).await?,
        Commands::Stats => stats(store.as_ref(), cli.json).await?,
    }

    Ok(())
}

async fn init(config: &ClipConfig) -> CliResult<()> {
    if let Some(parent) = config.database.path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::create_dir_all(&config.storage.media_dir)?;
    fs::create_dir_all(&config.storage.staging_dir)?;

    let store = SqliteStore::open_with_config(&config.database)?;
    println!(
        "Initialized database at: {} (schema v{})",
        config.database.path.display(),
        store.schema_version().await?
    );
    println!("Media directory: {}", config.storage.media_dir.display());
    Ok(())
}

fn read_url_list(path: &Path) -> CliResult<Vec<String>> {
    let content = fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect())
}

fn print_reports(reports: &[RunReport], json: bool) -> CliResult<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(reports)?);
        return Ok(());
    }
    for report in reports {
        println!("{}", report);
    }
    Ok(())
}

async fn top(pipeline: &Pipeline<SqliteStore>, n: usize, json: bool) -> CliResult<()> {
    let details = pipeline.top(n).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&details)?);
        return Ok(());
    }
    if details.is_empty() {
        println!("No contradictions found");
        return Ok(());
    }
    for (rank, detail) in details.iter().enumerate() {
        println!(
            "{:>3}. [{:.3}] {}",
            rank + 1,
            detail.record.score,
            format_summary_line(detail)
        );
    }
    Ok(())
}

async fn stats(store: &SqliteStore, json: bool) -> CliResult<()> {
    let stats = store.stats().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }
    println!("Schema version:     {}", stats.schema_version);
    println!(
        "Sources:            {} ({} not fetched)",
        stats.sources, stats.unfetched_sources
    );
    println!(
        "Files:              {} ({} transcribed)",
        stats.files, stats.transcribed_files
    );
    println!("Segments:           {}", stats.segments);
    println!("Embeddings:         {}", stats.embeddings);
    println!("Contradictions:     {}", stats.contradictions);
    println!("Settled file pairs: {}", stats.settled_file_pairs);
    println!("Media bytes:        {}", stats.storage_bytes);
    Ok(())
}
