//! # ragtp CLI
//!
//! Administration and query front end for the ingestion pipeline.
//!
//! ## Usage
//!
//! ```bash
//! ragtp --config ./config/ragtp.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ragtp init` | Create the SQLite database and schema |
//! | `ragtp source add\|list\|enable\|disable` | Manage scanned sources |
//! | `ragtp upload <file>` | Ingest a file as a temporary document |
//! | `ragtp scan <source_id>` | Incremental scan (`--full` for a full audit) |
//! | `ragtp job <id>` / `ragtp jobs` | Inspect job progress |
//! | `ragtp document <id>` | Show a document, its metadata and chunks |
//! | `ragtp search "<query>"` | Hybrid keyword + vector search |
//! | `ragtp ask "<question>"` | Answer with citations |
//! | `ragtp worker` | Consume queued tasks |
//! | `ragtp cleanup` | Soft-delete expired uploads |
//!
//! `upload --enqueue` and `scan --enqueue` hand the work to a worker
//! instead of running it in the foreground; that needs the Redis queue.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use ragtp::config::{self, Config, StoreBackend};
use ragtp::jobs::JobUpdate;
use ragtp::logging::init_logging;
use ragtp::migrate;
use ragtp::scanner::ScanMode;
use ragtp::search::{ScopeFilter, SearchRequest};
use ragtp::services::Services;
use ragtp::worker::{self, Task, TaskQueue, Worker};

/// ragtp: document ingestion and hybrid retrieval.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(
    name = "ragtp",
    about = "Document ingestion and hybrid retrieval for uploads and network shares",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ragtp.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Manage scanned sources.
    Source {
        #[command(subcommand)]
        action: SourceAction,
    },

    /// Ingest a file as a temporary document.
    ///
    /// The file is copied into the upload directory and expires after
    /// `uploads.temp_ttl_hours`.
    Upload {
        file: PathBuf,

        /// Queue the ingest for a worker instead of running it now.
        #[arg(long)]
        enqueue: bool,
    },

    /// Scan a source and ingest new or changed files.
    Scan {
        source_id: i64,

        /// Re-ingest every file regardless of fingerprint.
        #[arg(long)]
        full: bool,

        /// Queue the scan for a worker instead of running it now.
        #[arg(long)]
        enqueue: bool,
    },

    /// Show a job and its step history.
    Job { id: i64 },

    /// List queued and running jobs.
    Jobs,

    /// Show a document, its metadata and its chunks.
    Document { id: String },

    /// Hybrid keyword + vector search.
    Search {
        query: String,

        #[command(flatten)]
        scope: ScopeArgs,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Answer a question from indexed documents, with citations.
    Ask {
        question: String,

        #[command(flatten)]
        scope: ScopeArgs,
    },

    /// Consume queued tasks until Ctrl-C.
    Worker {
        /// Number of concurrent consumers (defaults to `worker.concurrency`).
        #[arg(long)]
        concurrency: Option<usize>,

        /// Also enqueue periodic scans and cleanup sweeps.
        #[arg(long)]
        schedule: bool,
    },

    /// Soft-delete temporary documents past their expiry.
    Cleanup,
}

#[derive(Subcommand)]
enum SourceAction {
    /// Register a directory under `scan.mount_root`.
    Add {
        base_path: String,

        /// Glob a file must match (repeatable). Matches everything if omitted.
        #[arg(long = "include")]
        include: Vec<String>,

        /// Glob that excludes a file (repeatable). Wins over include.
        #[arg(long = "exclude")]
        exclude: Vec<String>,
    },
    List,
    Enable { id: i64 },
    Disable { id: i64 },
}

/// Which documents a query may see.
#[derive(clap::Args)]
struct ScopeArgs {
    /// Restrict to one uploaded document.
    #[arg(long, conflicts_with = "source")]
    document: Option<String>,

    /// Restrict to these sources (repeatable). All sources if omitted.
    #[arg(long)]
    source: Vec<i64>,

    /// Case-insensitive prefix on the document's relative path.
    #[arg(long)]
    path_prefix: Option<String>,
}

impl ScopeArgs {
    fn into_filter(self) -> (ScopeFilter, Option<String>) {
        let scope = match self.document {
            Some(document_id) => ScopeFilter::Temp { document_id },
            None => ScopeFilter::Sources {
                source_ids: self.source,
            },
        };
        (scope, self.path_prefix)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    init_logging(&cfg.logging);

    if let Commands::Init = cli.command {
        migrate::run_migrations(&cfg).await?;
        println!("Database initialized successfully.");
        return Ok(());
    }

    let services = Services::connect(cfg).await?;

    match cli.command {
        Commands::Init => {}
        Commands::Source { action } => run_source(&services, action).await?,
        Commands::Upload { file, enqueue } => {
            // Resolve the queue before storing anything.
            let queue = if enqueue {
                Some(shared_queue(&services.config).await?)
            } else {
                None
            };
            let upload = services.upload(&file).await?;
            println!("document: {}", upload.document_id);
            println!("job:      {}", upload.job_id);
            if let Some(queue) = queue {
                let task = Task::IngestUpload {
                    document_id: upload.document_id.clone(),
                    job_id: upload.job_id,
                };
                if let Err(e) = queue.push(&task).await {
                    services
                        .jobs
                        .update(
                            upload.job_id,
                            JobUpdate::failed("enqueue", format!("enqueue error: {}", e)),
                        )
                        .await?;
                    services
                        .documents
                        .mark_failed(&upload.document_id, &e.to_string())
                        .await?;
                    return Err(e.into());
                }
                println!("queued.");
            } else {
                let report = services
                    .ingest_upload(&upload.document_id, upload.job_id)
                    .await?;
                println!(
                    "ingested {} chunks via {} (quality {:.2})",
                    report.chunks, report.parser_used, report.quality_score
                );
                for warning in &report.warnings {
                    println!("warning: {}", warning);
                }
            }
        }
        Commands::Scan {
            source_id,
            full,
            enqueue,
        } => {
            let mode = if full {
                ScanMode::FullAudit
            } else {
                ScanMode::Incremental
            };
            if enqueue {
                let task = match mode {
                    ScanMode::Incremental => Task::ScanIncremental { source_id },
                    ScanMode::FullAudit => Task::ScanFullAudit { source_id },
                };
                shared_queue(&services.config).await?.push(&task).await?;
                println!("queued.");
            } else {
                let report = services.scanner.scan(source_id, mode).await?;
                println!("job:       {}", report.job_id);
                println!("processed: {}", report.files_processed);
                println!("ingested:  {}", report.ingested);
                println!("unchanged: {}", report.unchanged);
                println!("megabytes: {:.1}", report.megabytes);
                if let Some(stop) = report.stopped_by {
                    println!("stopped early: {:?}", stop);
                }
            }
        }
        Commands::Job { id } => {
            let job = services
                .jobs
                .get(id)
                .await?
                .with_context(|| format!("job {} not found", id))?;
            println!("id:       {}", job.id);
            println!("type:     {}", job.job_type.as_str());
            println!("status:   {}", job.status);
            println!("progress: {}%", job.progress);
            println!("step:     {}", job.current_step);
            if let Some(message) = &job.message {
                println!("message:  {}", message);
            }
            println!();
            println!("--- Steps ---");
            for step in services.jobs.steps(id).await? {
                println!(
                    "{:>3}% {:<10} {:<18} {}",
                    step.progress,
                    step.status.to_string(),
                    step.step_name,
                    step.message.unwrap_or_default()
                );
            }
        }
        Commands::Jobs => {
            let jobs = services.jobs.list_active().await?;
            if jobs.is_empty() {
                println!("No active jobs.");
            }
            for job in jobs {
                println!(
                    "{:<6} {:<18} {:<8} {:>3}% {}",
                    job.id,
                    job.job_type.as_str(),
                    job.status.to_string(),
                    job.progress,
                    job.current_step
                );
            }
        }
        Commands::Document { id } => {
            let doc = services.documents.require(&id).await?;
            println!("--- Document ---");
            println!("id:            {}", doc.id);
            println!("title:         {}", doc.title);
            println!("scope:         {}", doc.scope.as_str());
            println!("status:        {}", doc.status.as_str());
            println!("relative_path: {}", doc.relative_path);
            println!("storage_path:  {}", doc.storage_path);
            if let Some(expires_at) = doc.expires_at {
                println!("expires_at:    {}", expires_at);
            }
            println!("meta:          {}", serde_json::to_string_pretty(&doc.meta)?);
            println!();
            let chunks = services.documents.chunks(&id).await?;
            println!("--- Chunks ({}) ---", chunks.len());
            for chunk in chunks {
                let label = chunk.page_or_sheet.as_deref().unwrap_or("-");
                println!("[{}] ({}) {}", chunk.chunk_index, label, preview(&chunk.content));
            }
        }
        Commands::Search {
            query,
            scope,
            limit,
        } => {
            let (scope, path_prefix) = scope.into_filter();
            let request = SearchRequest {
                query,
                scope,
                path_prefix,
                top_n: limit.unwrap_or(services.config.retrieval.final_top_n),
            };
            let hits = services.search.search(&request).await?;
            if hits.is_empty() {
                println!("No results.");
            }
            for (i, hit) in hits.iter().enumerate() {
                println!("{}. [{:.4}] {}", i + 1, hit.score, hit.title);
                println!("    path: {}", hit.relative_path);
                if let Some(label) = &hit.page_or_sheet {
                    println!("    at: {}", label);
                }
                println!("    excerpt: \"{}\"", preview(&hit.content));
                println!("    document: {}", hit.document_id);
                println!();
            }
        }
        Commands::Ask { question, scope } => {
            let (scope, path_prefix) = scope.into_filter();
            let answer = services.answers.ask(&question, scope, path_prefix).await?;
            println!("{}", answer.answer);
            if !answer.citations.is_empty() {
                println!();
                println!("--- Sources ---");
            }
            for (i, citation) in answer.citations.iter().enumerate() {
                let label = citation.page_or_sheet.as_deref().unwrap_or("-");
                println!("[{}] {} ({}, {})", i + 1, citation.title, citation.relative_path, label);
            }
        }
        Commands::Worker {
            concurrency,
            schedule,
        } => {
            let concurrency = concurrency.unwrap_or(services.config.worker.concurrency);
            let queue = worker::queue_from_config(&services.config.worker).await?;
            let worker = Worker::new(Arc::new(services), queue, concurrency);
            worker.run(schedule, worker::shutdown_on_ctrl_c()).await?;
        }
        Commands::Cleanup => {
            let removed = services.cleanup_expired().await?;
            println!("Removed {} expired documents.", removed);
        }
    }

    Ok(())
}

async fn run_source(services: &Services, action: SourceAction) -> anyhow::Result<()> {
    match action {
        SourceAction::Add {
            base_path,
            include,
            exclude,
        } => {
            let source = services.sources.add(&base_path, &include, &exclude).await?;
            println!("Added source {} ({}).", source.id, source.base_path);
        }
        SourceAction::List => {
            println!("{:<6} {:<8} {:<40} FILTERS", "ID", "ENABLED", "BASE PATH");
            for source in services.sources.list().await? {
                println!(
                    "{:<6} {:<8} {:<40} +{:?} -{:?}",
                    source.id, source.enabled, source.base_path, source.include_globs, source.exclude_globs
                );
            }
        }
        SourceAction::Enable { id } => {
            services.sources.set_enabled(id, true).await?;
            println!("Source {} enabled.", id);
        }
        SourceAction::Disable { id } => {
            services.sources.set_enabled(id, false).await?;
            println!("Source {} disabled.", id);
        }
    }
    Ok(())
}

/// The queue shared with worker processes. A memory queue would die with this process.
async fn shared_queue(cfg: &Config) -> anyhow::Result<Arc<dyn TaskQueue>> {
    if cfg.worker.queue != StoreBackend::Redis {
        bail!("--enqueue needs worker.queue = \"redis\"");
    }
    Ok(worker::queue_from_config(&cfg.worker).await?)
}

fn preview(content: &str) -> String {
    let flat = content.replace('\n', " ");
    let trimmed = flat.trim();
    let mut out: String = trimmed.chars().take(160).collect();
    if trimmed.chars().count() > 160 {
        out.push('…');
    }
    out
}
