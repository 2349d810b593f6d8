//! CLI command definitions for onto-forge.
//!
//! `run` starts a pipeline over a set of documents, `resume` continues a
//! pipeline from its first incomplete stage, and `status` prints the derived
//! status of a pipeline or one of its stages as JSON. `status --verify`
//! re-checks the stored artifacts against their recorded checksums.

use crate::llm::{LiteLlmClient, LlmTransform};
use crate::pipeline::{
    get_pipeline_status, get_stage_status, verify_artifacts, Orchestrator, PipelineConfig,
    PipelineRunReport,
};
use crate::registry::{SourceFile, SqliteVersionStore, Stage, StageStatus, VersionStore};
use crate::stages::{is_page_directory, is_supported_file, ProcessorContext, ProcessorSet};
use crate::storage::ArtifactStore;
use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

/// Ontology extraction pipeline for document collections.
#[derive(Parser)]
#[command(name = "onto-forge")]
#[command(about = "Build versioned domain ontologies from document collections")]
#[command(version)]
#[command(
    long_about = "onto-forge parses documents, extracts entities and relationships, merges and groups them, and renders a domain ontology.\n\nEvery stage attempt is recorded as a numbered version, so failed pipelines can be resumed.\n\nExample usage:\n  onto-forge run --domain banking --domain-version 1 --input ./docs"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// YAML configuration file. `FORGE_*` environment variables override it.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Create a pipeline and run it over the given documents.
    Run(RunArgs),

    /// Resume a pipeline from its first incomplete stage.
    Resume(ResumeArgs),

    /// Show the status of a pipeline or one of its stages.
    Status(StatusArgs),
}

/// Arguments for `onto-forge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Domain the ontology describes.
    #[arg(short, long)]
    pub domain: String,

    /// Version of the domain ontology being built.
    #[arg(long, default_value = "1")]
    pub domain_version: u32,

    /// Documents to parse. Directories are walked for supported files; a
    /// directory of numbered page images is a single document.
    #[arg(short, long = "input", required = true, num_args = 1..)]
    pub inputs: Vec<PathBuf>,

    /// Override the configured model.
    #[arg(short, long)]
    pub model: Option<String>,

    /// Print Prometheus metrics for the run to stderr.
    #[arg(long)]
    pub metrics: bool,
}

/// Arguments for `onto-forge resume`.
#[derive(Parser, Debug)]
pub struct ResumeArgs {
    /// Pipeline to resume.
    #[arg(short, long)]
    pub pipeline: Uuid,

    /// Documents to parse, if parsing has not completed. Defaults to the
    /// documents of earlier parse attempts.
    #[arg(short, long = "input")]
    pub inputs: Vec<PathBuf>,

    /// Print Prometheus metrics for the run to stderr.
    #[arg(long)]
    pub metrics: bool,
}

/// Arguments for `onto-forge status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Pipeline to inspect.
    #[arg(short, long)]
    pub pipeline: Uuid,

    /// Show a single stage (parse, extract, merge, group, ontology).
    #[arg(short, long, value_parser = parse_stage, conflicts_with = "verify")]
    pub stage: Option<Stage>,

    /// Check the latest completed artifacts against their checksums.
    #[arg(long)]
    pub verify: bool,
}

fn parse_stage(raw: &str) -> Result<Stage, String> {
    Stage::parse(raw).ok_or_else(|| {
        format!(
            "unknown stage '{}', expected one of: parse, extract, merge, group, ontology",
            raw
        )
    })
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse arguments and run the selected command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the selected command with already-parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = PipelineConfig::load(cli.config.as_deref()).context("Invalid configuration")?;

    match cli.command {
        Commands::Run(args) => run_pipeline_command(config, args).await?,
        Commands::Resume(args) => run_resume_command(config, args).await?,
        Commands::Status(args) => run_status_command(config, args).await?,
    }
    Ok(())
}

async fn run_pipeline_command(config: PipelineConfig, args: RunArgs) -> anyhow::Result<()> {
    let config = match args.model {
        Some(model) => config.with_model(model),
        None => config,
    };
    let sources = collect_sources(&args.inputs)?;
    if sources.is_empty() {
        anyhow::bail!("No supported documents found in the given inputs");
    }
    info!(
        domain = %args.domain,
        domain_version = args.domain_version,
        documents = sources.len(),
        "Starting pipeline"
    );

    let orchestrator = build_orchestrator(&config).await?;
    let report = orchestrator
        .start(&args.domain, args.domain_version, sources)
        .await?;
    if args.metrics {
        eprint!("{}", crate::metrics::export_metrics());
    }
    print_report(&report)
}

async fn run_resume_command(config: PipelineConfig, args: ResumeArgs) -> anyhow::Result<()> {
    let sources = collect_sources(&args.inputs)?;
    let orchestrator = build_orchestrator(&config).await?;
    let report = orchestrator.run(args.pipeline, sources).await?;
    if args.metrics {
        eprint!("{}", crate::metrics::export_metrics());
    }
    print_report(&report)
}

async fn run_status_command(config: PipelineConfig, args: StatusArgs) -> anyhow::Result<()> {
    let store = open_store(&config).await?;
    if args.verify {
        let artifacts = ArtifactStore::new(&config.artifact_root);
        let checks = verify_artifacts(store.as_ref(), &artifacts, args.pipeline).await?;
        println!("{}", serde_json::to_string_pretty(&checks)?);
        let broken = checks.iter().filter(|c| !c.intact).count();
        if broken > 0 {
            anyhow::bail!("{} of {} artifacts failed verification", broken, checks.len());
        }
        return Ok(());
    }
    let json = match args.stage {
        Some(stage) => {
            let report = get_stage_status(store.as_ref(), args.pipeline, stage).await?;
            serde_json::to_string_pretty(&report)?
        }
        None => {
            let report = get_pipeline_status(store.as_ref(), args.pipeline).await?;
            serde_json::to_string_pretty(&report)?
        }
    };
    println!("{}", json);
    Ok(())
}

fn print_report(report: &PipelineRunReport) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    if report.status == StageStatus::Failed {
        anyhow::bail!(
            "Pipeline {} failed at {}: {}",
            report.pipeline_id,
            report.stage,
            report.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

async fn open_store(config: &PipelineConfig) -> anyhow::Result<Arc<dyn VersionStore>> {
    let store = SqliteVersionStore::connect(&config.database_url)
        .await
        .with_context(|| format!("Failed to open version store at {}", config.database_url))?;
    Ok(Arc::new(store))
}

async fn build_orchestrator(config: &PipelineConfig) -> anyhow::Result<Orchestrator> {
    let provider = LiteLlmClient::from_env().map_err(|e| {
        anyhow::anyhow!(
            "Failed to initialize LLM client: {}. Please set LITELLM_API_BASE (and LITELLM_API_KEY if required).",
            e
        )
    })?;
    let transform = LlmTransform::new(Arc::new(provider))
        .with_model(config.model.clone())
        .with_temperature(config.temperature)
        .with_max_tokens(config.max_tokens);

    if let Err(e) = crate::metrics::init_metrics() {
        warn!(error = %e, "Failed to register metrics");
    }

    let store = open_store(config).await?;
    let ctx = Arc::new(ProcessorContext::new(config.clone(), Arc::new(transform)));
    let processors = ProcessorSet::standard(ctx);
    Ok(Orchestrator::new(config, store, processors)?)
}

/// Resolves `--input` paths to source files.
///
/// Files are taken as given. A directory holding numbered page images is one
/// document; any other directory is walked for supported files.
fn collect_sources(inputs: &[PathBuf]) -> anyhow::Result<Vec<SourceFile>> {
    let mut sources = Vec::new();
    for input in inputs {
        if input.is_dir() && !is_page_directory(input) {
            for entry in WalkDir::new(input)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file() && is_supported_file(e.path()))
            {
                sources.push(source_file(entry.path())?);
            }
        } else {
            sources.push(source_file(input)?);
        }
    }
    Ok(sources)
}

fn source_file(path: &Path) -> anyhow::Result<SourceFile> {
    SourceFile::from_path(path).with_context(|| format!("Failed to read input {}", path.display()))
}
