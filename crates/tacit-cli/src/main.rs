//! tacit - operate a file-backed silent submission queue.
//!
//! `enqueue` and `inspect` only touch the store; `run` boots the engine
//! against a simulated transport and drains every queue.

mod simulated;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};
use tacit_core::impls::FileStore;
use tacit_core::{RequestDescriptor, SilentConfig, SilentQueue, SilentQueueBuilder};
use tokio::time::{Duration, sleep};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::simulated::SimulatedTransport;

#[derive(Parser)]
#[command(name = "tacit", version, about = "Durable, ordered, retrying submission queue")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Persist a durable operation without dispatching it
    Enqueue(EnqueueArgs),

    /// Print the persisted queues as JSON
    Inspect(StoreArgs),

    /// Boot the engine and drain every queue
    Run(RunArgs),
}

#[derive(Args)]
struct StoreArgs {
    /// Store directory
    #[arg(long)]
    dir: PathBuf,

    /// Engine configuration (JSON)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Args)]
struct EnqueueArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// Queue name (defaults to the configured default queue)
    #[arg(long)]
    queue: Option<String>,

    #[arg(long, default_value = "POST")]
    method: String,

    #[arg(long)]
    target: String,

    /// Request body (JSON)
    #[arg(long)]
    body: Option<String>,

    /// Override the configured retry budget
    #[arg(long)]
    max_retries: Option<u32>,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// Fail the first N sends with a network error
    #[arg(long, default_value_t = 0)]
    fail_times: u32,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

fn load_config(path: Option<&Path>) -> Result<SilentConfig> {
    let Some(path) = path else {
        return Ok(SilentConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    SilentConfig::from_json(&raw).with_context(|| format!("parsing config {}", path.display()))
}

fn open_queue(args: &StoreArgs, transport: SimulatedTransport) -> Result<SilentQueue> {
    let config = load_config(args.config.as_deref())?;
    let store = FileStore::open(&args.dir)
        .with_context(|| format!("opening store {}", args.dir.display()))?;
    let queue = SilentQueueBuilder::new()
        .store(Arc::new(store))
        .transport(Arc::new(transport))
        .config(config)
        .build()?;
    Ok(queue)
}

async fn enqueue(args: EnqueueArgs) -> Result<()> {
    let queue = open_queue(&args.store, SimulatedTransport::new(0))?;

    let mut request = RequestDescriptor::new(args.method, args.target);
    if let Some(body) = &args.body {
        let body: Value = serde_json::from_str(body).context("--body is not valid JSON")?;
        request = request.with_body(body);
    }
    let mut operation = queue.new_operation(request).durable(true);
    if let Some(name) = args.queue {
        operation = operation.in_queue(name);
    }
    if let Some(max_retries) = args.max_retries {
        operation.retry_policy.max_retries = max_retries;
    }

    let id = queue.enqueue(operation).await?;
    println!("{id}");
    Ok(())
}

async fn inspect(args: StoreArgs) -> Result<()> {
    let queue = open_queue(&args, SimulatedTransport::new(0))?;
    let report = queue.restore_from_store().await;

    let skipped: Vec<Value> = report
        .skipped
        .iter()
        .map(|entry| json!({"key": entry.key, "reason": entry.reason}))
        .collect();
    let out = json!({
        "restored_ok": report.restored_ok,
        "queues": report.queues,
        "skipped": skipped,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

async fn run(args: RunArgs) -> Result<()> {
    let queue = open_queue(&args.store, SimulatedTransport::new(args.fail_times))?;

    let _retry = queue.on_retry(|e| {
        info!(
            operation = %e.operation.id,
            attempt = e.attempt,
            delay_ms = e.delay.as_millis() as u64,
            "retry scheduled"
        )
    });
    let _fail = queue.on_fail(|e| {
        warn!(operation = %e.operation.id, attempt = e.attempt, error = %e.error, "operation failed")
    });
    let _success = queue.on_success(|e| {
        info!(operation = %e.operation.id, response = %e.response, "operation succeeded")
    });

    let boot = queue.boot().await?;
    info!(
        operations = boot.operations,
        queues = ?boot.queues,
        skipped = boot.skipped.len(),
        "restored"
    );

    tokio::select! {
        _ = drained(&queue) => info!("all queues drained"),
        _ = tokio::signal::ctrl_c() => warn!("interrupted; pending operations stay queued"),
    }
    queue.shutdown().await;
    Ok(())
}

async fn drained(queue: &SilentQueue) {
    while !queue.is_empty().await {
        sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Enqueue(args) => enqueue(args).await,
        Commands::Inspect(args) => inspect(args).await,
        Commands::Run(args) => run(args).await,
    }
}
