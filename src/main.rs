mod browser;
mod config;
mod error;
mod extract;
mod grid;
mod ledger;
mod retry;
mod rules;
mod scheduler;
mod snapshot;
mod ui;
mod walk;
mod workflow;

#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use fantoccini::Client;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, info_span, warn, Span};

use crate::browser::webdriver::{self, WebDriverPage};
use crate::config::HarvestConfig;
use crate::extract::Extractor;
use crate::ledger::{AppendLedger, MergeLedger, RecordSink, RowPolicy, Schema};
use crate::retry::RetryPolicy;
use crate::scheduler::{navigation_retry, Scheduler, Task};
use crate::snapshot::SnapshotStore;
use crate::ui::Ui;
use crate::walk::GridWalk;

const DEFAULT_CONFIG: &str = "harvest.toml";

#[derive(Parser)]
#[command(name = "harvest", about = "Harvest records from a web back office through parallel browser sessions")]
struct Cli {
    /// Configuration file (default: harvest.toml, optional)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Harvest records for a list of ids into the ledger
    Harvest(HarvestArgs),
    /// Walk every grid row and apply the configured add/remove rules
    Walk {
        /// First row ordinal to process
        #[arg(long, default_value = "1")]
        start: u64,
        /// How far past the last ordinal to look for the next row
        #[arg(long)]
        lookahead: Option<u64>,
        /// Exit without waiting for Enter at the end
        #[arg(long)]
        no_confirm: bool,
        #[command(flatten)]
        credentials: Credentials,
    },
    /// Show ledger statistics
    Stats,
}

#[derive(Args)]
struct HarvestArgs {
    /// A single id to harvest
    #[arg(long, conflicts_with = "input")]
    id: Option<String>,
    /// CSV file whose first column holds the ids
    #[arg(short, long)]
    input: Option<PathBuf>,
    /// The input file starts with a header row
    #[arg(long)]
    headers: bool,
    /// Skip ids before this one
    #[arg(long)]
    start: Option<String>,
    /// Number of parallel browser tabs (default: pool.size from config)
    #[arg(long)]
    pool: Option<usize>,
    #[arg(long, value_enum, default_value_t = Mode::Append)]
    mode: Mode,
    /// Exit without waiting for Enter at the end
    #[arg(long)]
    no_confirm: bool,
    #[command(flatten)]
    credentials: Credentials,
}

#[derive(Args)]
struct Credentials {
    #[arg(short, long, env = "HARVEST_USERNAME")]
    username: String,
    #[arg(short, long, env = "HARVEST_PASSWORD", hide_env_values = true)]
    password: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// Append new rows, resuming after ids already in the ledger
    Append,
    /// Fill empty fields of existing rows
    Update,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let explicit = cli.config.is_some();
    let path = cli.config.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let cfg = HarvestConfig::load(&path, explicit)?;

    let result = match cli.command {
        Commands::Harvest(args) => harvest(&cfg, args).await,
        Commands::Walk {
            start,
            lookahead,
            no_confirm,
            credentials,
        } => walk(&cfg, start, lookahead, no_confirm, &credentials).await,
        Commands::Stats => stats(&cfg),
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

async fn harvest(cfg: &HarvestConfig, args: HarvestArgs) -> anyhow::Result<()> {
    let schema = Schema::new(cfg.ledger.fields.clone())?;
    let policy = RowPolicy::new(&schema, &cfg.ledger);

    let ids = match (&args.id, &args.input) {
        (Some(id), _) => vec![id.trim().to_string()],
        (None, Some(input)) => ledger::load_task_ids(input, args.headers)
            .with_context(|| format!("reading ids from {}", input.display()))?,
        (None, None) => bail!("either --id or --input is required"),
    };
    let ids = ledger::start_from(ids, args.start.as_deref());
    if ids.is_empty() {
        println!("No ids to harvest.");
        return Ok(());
    }

    let ledger_path = &cfg.ledger.path;
    let batch = cfg.pool.batch_size;
    let (tasks, mut sink): (Vec<Task>, Box<dyn RecordSink>) = match args.mode {
        Mode::Append => {
            let ledger = AppendLedger::open(ledger_path, schema, cfg.ledger.error_field().map(str::to_string), batch)
                .with_context(|| format!("opening {}", ledger_path.display()))?;
            let mut seen = ledger.existing_keys()?;
            let before = ids.len();
            let tasks: Vec<Task> = ids
                .into_iter()
                .filter(|id| seen.insert(id.clone()))
                .map(Task::new)
                .collect();
            if tasks.len() < before {
                info!("Skipping {} ids already in {}", before - tasks.len(), ledger_path.display());
            }
            (tasks, Box::new(ledger) as Box<dyn RecordSink>)
        }
        Mode::Update => {
            let ledger = MergeLedger::open(ledger_path, schema, policy.clone(), batch)
                .with_context(|| format!("opening {}", ledger_path.display()))?;
            let plan = ledger.plan(&ids);
            let tasks: Vec<Task> = plan
                .pending
                .into_iter()
                .map(|(id, prior)| Task { id, prior })
                .collect();
            (tasks, Box::new(ledger) as Box<dyn RecordSink>)
        }
    };
    if tasks.is_empty() {
        println!("Nothing to harvest: {} is up to date.", ledger_path.display());
        return Ok(());
    }

    let snapshots = cfg
        .ledger
        .snapshot_dir
        .as_deref()
        .map(SnapshotStore::create)
        .transpose()?;
    let extractor = Extractor::new(&cfg.extract, &policy, snapshots.as_ref());
    let workflow = workflow::from_settings::<WebDriverPage>(&cfg.navigation, extractor, &args.credentials.password);

    let size = args.pool.unwrap_or(cfg.pool.size).clamp(1, tasks.len());
    let run_span = info_span!("run", run_mode = ?args.mode);
    let client = webdriver::connect(&cfg.webdriver_url, cfg.headless).await?;

    let result = async {
        let uis = sessions(cfg, &client, size, &run_span).await?;
        login(cfg, &uis[0], &args.credentials).await?;

        println!("Harvesting {} ids with {} tabs ({:?} mode)", tasks.len(), size, args.mode);
        let summary = Scheduler::new(uis, workflow.as_ref(), cfg.pool.clone(), navigation_retry(&cfg.retry))
            .with_progress(progress_bar(tasks.len())?)
            .run(tasks, sink.as_mut())
            .await?;
        println!(
            "Harvested {} ids ({} failed) into {}",
            summary.completed,
            summary.failed,
            ledger_path.display()
        );
        if !args.no_confirm {
            wait_for_enter("Press Enter to close the browser.").await?;
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    close(client).await;
    result
}

async fn walk(
    cfg: &HarvestConfig,
    start: u64,
    lookahead: Option<u64>,
    no_confirm: bool,
    credentials: &Credentials,
) -> anyhow::Result<()> {
    let run_span = info_span!("run", run_mode = "walk");
    let client = webdriver::connect(&cfg.webdriver_url, cfg.headless).await?;

    let result = async {
        let uis = sessions(cfg, &client, 1, &run_span).await?;
        let ui = &uis[0];
        login(cfg, ui, credentials).await?;

        let summary = GridWalk::new(ui, &cfg.grid, &cfg.walk)
            .run(start, lookahead.unwrap_or(cfg.grid.lookahead))
            .await?;
        println!(
            "Visited {} rows: {} saved, {} not saved, {} unexpected selections",
            summary.rows, summary.saved, summary.unsaved, summary.unexpected
        );
        if !no_confirm {
            wait_for_enter("Press Enter to close the browser.").await?;
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    close(client).await;
    result
}

fn stats(cfg: &HarvestConfig) -> anyhow::Result<()> {
    let schema = Schema::new(cfg.ledger.fields.clone())?;
    let policy = RowPolicy::new(&schema, &cfg.ledger);
    let s = ledger::stats(&cfg.ledger.path, &schema, &policy)?;
    println!("Ledger:     {}", cfg.ledger.path.display());
    println!("Rows:       {}", s.rows);
    println!("Complete:   {}", s.complete);
    println!("Incomplete: {}", s.incomplete);
    println!("Terminal:   {}", s.terminal);
    Ok(())
}

async fn sessions(
    cfg: &HarvestConfig,
    client: &Client,
    count: usize,
    run_span: &Span,
) -> anyhow::Result<Vec<Ui<WebDriverPage>>> {
    let pages = webdriver::open_pages(client, count, &cfg.overlay_selector).await?;
    let retry = RetryPolicy::from_settings(&cfg.retry);
    Ok(pages
        .into_iter()
        .enumerate()
        .map(|(i, page)| {
            let span = info_span!(parent: run_span, "session", session = i);
            Ui::new(page, retry.clone(), cfg.timeouts.clone(), span)
        })
        .collect())
}

/// Sign in on the first tab; the others share its cookies.
async fn login(cfg: &HarvestConfig, ui: &Ui<WebDriverPage>, credentials: &Credentials) -> anyhow::Result<()> {
    workflow::sign_in(ui, &cfg.login, &credentials.username, &credentials.password)
        .await
        .context("login failed")?;
    wait_for_enter("Finish any second-factor prompt in the browser, then press Enter.").await
}

async fn wait_for_enter(prompt: &str) -> anyhow::Result<()> {
    println!("{}", prompt);
    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("reading stdin")?;
    Ok(())
}

async fn close(client: Client) {
    if let Err(e) = client.close().await {
        warn!("Closing the browser failed: {}", e);
    }
}

fn progress_bar(len: usize) -> anyhow::Result<ProgressBar> {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")?,
    );
    Ok(pb)
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
