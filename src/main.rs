use std::process::ExitCode;
use std::sync::Arc;

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::error;

use tendervec::categorize::{CategorizationStrategy, Categorizer};
use tendervec::embed::{EmbeddingGenerator, HttpEmbeddingProvider};
use tendervec::fetcher::WindowFetcher;
use tendervec::pipeline::{Granularity, Orchestrator, StageReport, WindowOverride};
use tendervec::ratelimit::{AdaptiveLimiter, LimiterConfig};
use tendervec::source::{FetchMode, RegistryClient};
use tendervec::watermark::WatermarkStore;
use tendervec::{db, telemetry, PipelineError, Settings};

#[derive(Parser)]
#[command(name = "tendervec", version, about = "Procurement notice pipeline: fetch, embed, categorize")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose (debug-level) logs.
    #[arg(long, global = true)]
    trace: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest notices from the registry into the local store.
    Fetch(WindowArgs),
    /// Generate embeddings for pending notices.
    Embed(EmbedArgs),
    /// Assign CPV categories to embedded notices.
    Categorize(CategorizeArgs),
    /// Run fetch, embed, and categorize in order.
    Run(WindowArgs),
}

#[derive(Args, Clone)]
struct WindowArgs {
    /// Window start, YYYYMMDD. Omit to derive from watermarks.
    #[arg(long, value_parser = parse_compact_date)]
    from: Option<NaiveDate>,

    /// Window end, YYYYMMDD. Omit to derive from watermarks.
    #[arg(long, value_parser = parse_compact_date)]
    to: Option<NaiveDate>,

    /// Which registry timestamp bounds the window.
    #[arg(long, value_enum, default_value_t = ModeArg::ByPublication)]
    mode: ModeArg,

    /// Process the whole window in one call instead of day by day.
    /// The watermark then advances once, after the entire window commits.
    #[arg(long)]
    whole_window: bool,
}

#[derive(Args, Clone)]
struct EmbedArgs {
    #[command(flatten)]
    window: WindowArgs,

    /// Notices per provider call.
    #[arg(long, default_value_t = 48)]
    batch_size: usize,
}

#[derive(Args, Clone)]
struct CategorizeArgs {
    #[command(flatten)]
    window: WindowArgs,

    /// Nearest categories persisted per notice.
    #[arg(long, default_value_t = 5)]
    top_k: usize,

    /// Search strategy label, e.g. exact, ivfflat:10, hnsw:40:half.
    /// Defaults to $CATEGORIZER_STRATEGY, then exact.
    #[arg(long)]
    strategy: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    ByPublication,
    ByUpdate,
}

impl From<ModeArg> for FetchMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::ByPublication => FetchMode::ByPublication,
            ModeArg::ByUpdate => FetchMode::ByUpdate,
        }
    }
}

fn parse_compact_date(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw, "%Y%m%d").map_err(|e| format!("expected YYYYMMDD: {e}"))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    telemetry::init(cli.trace);

    match run(cli).await {
        Ok(reports) => {
            let mut any_failed = false;
            for report in &reports {
                println!(
                    "{}: days={} processed={} succeeded={} failed={} watermark={}",
                    report.stage,
                    report.days,
                    report.processed,
                    report.succeeded,
                    report.failed,
                    report
                        .advanced_to
                        .map(|d| d.to_string())
                        .unwrap_or_else(|| "-".into()),
                );
                any_failed |= !report.is_clean();
            }
            if any_failed {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            if e.is_fatal() {
                error!(error = %e, "fatal error, aborting run");
            } else {
                error!(error = %e, "run failed; committed work is retained");
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<Vec<StageReport>, PipelineError> {
    let settings = Settings::from_env()?;
    let pool = db::connect(&settings.database_url).await?;
    db::preflight(&pool).await?;

    let limiter = Arc::new(AdaptiveLimiter::new(LimiterConfig::default()));
    let client = RegistryClient::new(&settings, Arc::clone(&limiter))?;
    let watermarks = WatermarkStore::new(pool.clone(), settings.epoch);

    let window_args = match &cli.command {
        Command::Fetch(args) | Command::Run(args) => args.clone(),
        Command::Embed(args) => args.window.clone(),
        Command::Categorize(args) => args.window.clone(),
    };
    let overrides = WindowOverride {
        from: window_args.from,
        to: window_args.to,
    };
    let granularity = if window_args.whole_window {
        Granularity::WholeWindow
    } else {
        Granularity::DayByDay
    };
    let (batch_size, top_k, strategy_label) = match &cli.command {
        Command::Fetch(_) | Command::Run(_) => (48, 5, None),
        Command::Embed(args) => (args.batch_size, 5, None),
        Command::Categorize(args) => (48, args.top_k, args.strategy.clone()),
    };

    let strategy_label = strategy_label
        .or_else(|| std::env::var("CATEGORIZER_STRATEGY").ok())
        .unwrap_or_else(|| "exact".to_string());
    let strategy = CategorizationStrategy::parse(&strategy_label)?;

    let provider = Arc::new(HttpEmbeddingProvider::new(&settings, Arc::clone(&limiter))?);
    let fetcher = WindowFetcher::new(pool.clone(), client);
    let embedder = EmbeddingGenerator::new(pool.clone(), provider, batch_size, settings.workers);
    let categorizer = Categorizer::new(pool.clone(), top_k, settings.workers).with_strategy(strategy);

    let orchestrator = Orchestrator::new(
        watermarks,
        fetcher,
        embedder,
        categorizer,
        window_args.mode.into(),
    )
    .with_granularity(granularity);

    match cli.command {
        Command::Fetch(_) => Ok(vec![orchestrator.run_fetch(overrides).await?]),
        Command::Embed(_) => Ok(vec![orchestrator.run_embed(overrides).await?]),
        Command::Categorize(_) => Ok(vec![orchestrator.run_categorize(overrides).await?]),
        Command::Run(_) => orchestrator.run_all(overrides).await,
    }
}
