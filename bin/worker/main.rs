//! Judge Worker
//!
//! Runs the judging scheduler over a backlog file, or inspects the commit
//! history of a single repository.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use judge_engine::events::EventSink;
use judge_engine::{
    CodeType, CommandBundler, EvaluationPipeline, EventDispatcher, FallbackSheetSink, FileBacklog,
    GitHistorySource, Hackathon, HistorySource, HttpRequestExecutor, IrregularityDetector,
    JobJournal, JobScheduler, JudgeConfig, LocalVerdictStore, LogSink, MemoryCache, ProjectJudge,
    WebhookSink,
};

#[derive(Parser, Debug)]
#[command(name = "judge-worker")]
#[command(about = "Hackathon judging worker")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Judge every eligible project in a backlog file until interrupted
    Run {
        /// TOML configuration file
        #[arg(short, long, env = "JUDGE_CONFIG")]
        config: Option<PathBuf>,

        /// JSON file with the project backlog
        #[arg(short, long, env = "JUDGE_BACKLOG")]
        backlog: PathBuf,

        /// Override the worker concurrency
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Print the irregularity report of one repository as JSON
    History {
        /// Repository URL
        repo_url: String,

        /// Event start (RFC 3339)
        #[arg(long)]
        start: Option<DateTime<Utc>>,

        /// Submission deadline (RFC 3339)
        #[arg(long)]
        end: Option<DateTime<Utc>>,

        /// Treat the project as declared fresh code
        #[arg(long)]
        fresh_code: bool,

        /// TOML configuration file
        #[arg(short, long, env = "JUDGE_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Clear the review notes of a corrected project so it is judged again
    Release {
        /// Project ID
        project_id: String,

        /// TOML configuration file
        #[arg(short, long, env = "JUDGE_CONFIG")]
        config: Option<PathBuf>,
    },
}

fn sinks(config: &JudgeConfig) -> Result<Vec<Arc<dyn EventSink>>> {
    let mut sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(LogSink)];
    if let Some(url) = &config.notifications.webhook_url {
        sinks.push(Arc::new(WebhookSink::new(url.clone())?));
    }
    if let Some(url) = &config.notifications.fallback_csv_endpoint {
        sinks.push(Arc::new(FallbackSheetSink::new(url.clone())?));
    }
    Ok(sinks)
}

async fn run(config_path: Option<PathBuf>, backlog: PathBuf, concurrency: Option<usize>) -> Result<()> {
    let mut config = JudgeConfig::load(config_path.as_deref()).context("Failed to load configuration")?;
    if let Some(n) = concurrency {
        config.scheduler.concurrency = n;
    }
    config.validate()?;

    info!("Starting judge worker");
    info!("  Backlog: {}", backlog.display());
    info!("  Database: {}", config.storage.db_path.display());
    info!("  Provider: {} ({})", config.llm.provider.as_str(), config.llm.model());
    info!("  Concurrency: {}", config.scheduler.concurrency);

    let store = Arc::new(LocalVerdictStore::new(&config.storage.db_path)?);
    let journal = Arc::new(JobJournal::open(&config.storage.db_path)?);
    let executor = Arc::new(HttpRequestExecutor::new(&config.llm)?);
    let retrieval = Arc::new(CommandBundler::new(&config.bundler));
    let cache = Arc::new(MemoryCache::new(Duration::from_secs(config.pipeline.cache_ttl_secs)));
    let (events, dispatcher_handle) = EventDispatcher::start(sinks(&config)?);

    let pipeline = Arc::new(
        EvaluationPipeline::new(
            executor,
            retrieval,
            cache,
            config.pipeline.clone(),
            config.chunker.clone(),
        )
        .with_store(store.clone()),
    );

    let judge = ProjectJudge::new(pipeline, store.clone())
        .with_history(
            Arc::new(GitHistorySource::default()),
            IrregularityDetector::new(config.irregularity.clone()),
        )
        .with_events(events.clone());

    let backlog = FileBacklog::new(backlog)
        .with_store(store.clone())
        .with_events(events.clone());

    let scheduler = JobScheduler::builder(config.scheduler.clone(), Arc::new(judge))
        .backlog(Arc::new(backlog))
        .journal(journal)
        .events(events.clone())
        .build();

    scheduler.start().await;

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    info!("Shutdown requested; finishing in-flight jobs");
    scheduler.stop().await;

    let stats = scheduler.stats();
    info!(
        "Final stats: {} completed, {} failed, {} waiting, {} verdicts stored",
        stats.completed,
        stats.failed,
        stats.waiting,
        store.judged_count()?
    );

    drop(scheduler);
    drop(events);
    if tokio::time::timeout(Duration::from_secs(10), dispatcher_handle).await.is_err() {
        warn!("Event delivery did not drain within 10s");
    }
    Ok(())
}

async fn history(
    repo_url: String,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    fresh_code: bool,
    config_path: Option<PathBuf>,
) -> Result<()> {
    let config = JudgeConfig::load(config_path.as_deref()).context("Failed to load configuration")?;
    let commits = GitHistorySource::default()
        .commits(&repo_url)
        .await
        .with_context(|| format!("Failed to read history of {}", repo_url))?;
    info!("Read {} commits from {}", commits.len(), repo_url);

    let hackathon = Hackathon {
        start_date: start,
        end_date: end,
        ..Default::default()
    };
    let declared = fresh_code.then_some(CodeType::FreshCode);
    let report = IrregularityDetector::new(config.irregularity).analyze(&commits, &hackathon, declared);

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn release(project_id: String, config_path: Option<PathBuf>) -> Result<()> {
    let config = JudgeConfig::load(config_path.as_deref()).context("Failed to load configuration")?;
    let store = LocalVerdictStore::new(&config.storage.db_path)?;
    let released = store.clear_review_notes(&project_id)?;
    if released == 0 {
        warn!("Project {} has no pending review notes", project_id);
    } else {
        info!("Released {} challenges of project {}", released, project_id);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("judge_engine=debug,info")),
        )
        .init();

    let args = Args::parse();
    match args.command {
        Command::Run {
            config,
            backlog,
            concurrency,
        } => run(config, backlog, concurrency).await,
        Command::History {
            repo_url,
            start,
            end,
            fresh_code,
            config,
        } => history(repo_url, start, end, fresh_code, config).await,
        Command::Release { project_id, config } => release(project_id, config),
    }
}
