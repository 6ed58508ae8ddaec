//! CLI command definitions for queue-dispatch.
//!
//! Every command reads [`Settings`] from the environment first; flags given
//! on the command line override individual values.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Settings;
use crate::execution::{build_launcher, LauncherKind};
use crate::metrics::{export_metrics, init_metrics, MetricsCollector, MetricsServer};
use crate::provision::CertSource;
use crate::scheduler::shutdown::{self, spawn_signal_listener, Shutdown};
use crate::scheduler::{
    new_owner_id, DispatchReport, Dispatcher, HttpProcessor, Worker, WorkerError, WorkerOutcome,
};
use crate::storage::{self, EntryStatus, QueueEntry, StatusCounts};

/// Lease-based work-queue dispatcher and worker.
#[derive(Parser)]
#[command(name = "queue-dispatch")]
#[command(about = "Dispatch batch workers over a durable SQL work queue")]
#[command(version)]
#[command(
    long_about = "queue-dispatch scales batch workers to the backlog of a SQL queue table.\n\nThe dispatcher reclaims stale leases and launches workers; each worker claims one batch, calls the processing endpoint for every row and records the outcome.\n\nExample usage:\n  queue-dispatch migrate\n  queue-dispatch enqueue --payload '{\"report\":\"daily\"}'\n  queue-dispatch dispatch --loop"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Queue store URL (postgres://… or sqlite:…).
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    pub database_url: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Create the queue table and indexes.
    Migrate(MigrateArgs),

    /// Add pending entries to the queue.
    Enqueue(EnqueueArgs),

    /// Run dispatch cycles: reclaim stale rows and launch workers.
    Dispatch(DispatchArgs),

    /// Claim and process one batch, then exit.
    Work(WorkArgs),

    /// Show queue counts per status.
    Stats(StatsArgs),

    /// Show a single queue entry.
    Show(ShowArgs),
}

/// Arguments for `queue-dispatch migrate`.
#[derive(Parser, Debug)]
pub struct MigrateArgs {
    /// Output JSON instead of text.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `queue-dispatch enqueue`.
#[derive(Parser, Debug)]
pub struct EnqueueArgs {
    /// JSON payload for a single entry.
    #[arg(short, long, conflicts_with = "file")]
    pub payload: Option<String>,

    /// File with one JSON payload per line.
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Output JSON instead of text.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `queue-dispatch dispatch`.
#[derive(Parser, Debug)]
pub struct DispatchArgs {
    /// Keep running cycles on the dispatch interval until SIGINT/SIGTERM.
    #[arg(long = "loop")]
    pub run_loop: bool,

    /// Rows per worker.
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Maximum workers launched per cycle.
    #[arg(long)]
    pub max_workers: Option<usize>,

    /// Worker launcher (docker, process).
    #[arg(long)]
    pub launcher: Option<LauncherKind>,

    /// Requeue failed rows below the retry ceiling each cycle.
    #[arg(long)]
    pub retry_failed: bool,

    /// Serve Prometheus metrics on this address while looping.
    #[arg(long, env = "QUEUE_METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,

    /// Output the cycle report as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `queue-dispatch work`.
#[derive(Parser, Debug)]
pub struct WorkArgs {
    /// Owner id to claim under. Defaults to QUEUE_WORKER_OWNER_ID, then a fresh id.
    #[arg(long)]
    pub owner_id: Option<String>,

    /// Maximum rows to claim.
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Call the endpoint without a client certificate.
    #[arg(long)]
    pub allow_plaintext: bool,

    /// Output the batch summary as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Output format for `queue-dispatch stats`.
#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StatsFormat {
    #[default]
    Table,
    Json,
    Prometheus,
}

/// Arguments for `queue-dispatch stats`.
#[derive(Parser, Debug)]
pub struct StatsArgs {
    /// Output format.
    #[arg(short, long, value_enum, default_value_t = StatsFormat::Table)]
    pub format: StatsFormat,
}

/// Arguments for `queue-dispatch show`.
#[derive(Parser, Debug)]
pub struct ShowArgs {
    /// Entry id.
    pub id: i64,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let settings = Settings::from_env_with(cli.database_url).context("Invalid configuration")?;

    match cli.command {
        Commands::Migrate(args) => run_migrate_command(settings, args).await,
        Commands::Enqueue(args) => run_enqueue_command(settings, args).await,
        Commands::Dispatch(args) => run_dispatch_command(settings, args).await,
        Commands::Work(args) => run_work_command(settings, args).await,
        Commands::Stats(args) => run_stats_command(settings, args).await,
        Commands::Show(args) => run_show_command(settings, args).await,
    }
}

// ============================================================================
// Queue administration
// ============================================================================

async fn run_migrate_command(settings: Settings, args: MigrateArgs) -> anyhow::Result<()> {
    let store = storage::connect(&settings.database_url, settings.queue(), None).await?;
    let applied = store.migrate().await;
    store.close().await;
    let applied = applied?;

    if args.json {
        let output = serde_json::json!({
            "table": settings.queue_table,
            "applied": applied,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!(
            "Applied {} migration statement(s) for table '{}'",
            applied, settings.queue_table
        );
    }
    Ok(())
}

async fn run_enqueue_command(settings: Settings, args: EnqueueArgs) -> anyhow::Result<()> {
    let payloads = read_payloads(&args)?;
    if payloads.is_empty() {
        anyhow::bail!("Nothing to enqueue: pass --payload or --file");
    }

    let store = storage::connect(&settings.database_url, settings.queue(), None).await?;
    let mut ids = Vec::with_capacity(payloads.len());
    for payload in &payloads {
        match store.enqueue(payload).await {
            Ok(id) => ids.push(id),
            Err(e) => {
                store.close().await;
                let context = format!("Enqueued {} of {} entries", ids.len(), payloads.len());
                return Err(e).context(context);
            }
        }
    }
    store.close().await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "ids": ids }))?);
    } else {
        for id in &ids {
            println!("{id}");
        }
    }
    info!(count = ids.len(), "Enqueued entries");
    Ok(())
}

fn read_payloads(args: &EnqueueArgs) -> anyhow::Result<Vec<serde_json::Value>> {
    if let Some(raw) = &args.payload {
        let value = serde_json::from_str(raw).context("--payload is not valid JSON")?;
        return Ok(vec![value]);
    }

    let Some(path) = &args.file else {
        return Ok(Vec::new());
    };

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("{}:{} is not valid JSON", path.display(), idx + 1))
        })
        .collect()
}

async fn run_stats_command(settings: Settings, args: StatsArgs) -> anyhow::Result<()> {
    let store = storage::connect(&settings.database_url, settings.queue(), None).await?;
    let counts = store.status_counts().await;
    store.close().await;
    let counts = counts?;

    match args.format {
        StatsFormat::Table => print!("{}", render_stats_table(&counts)),
        StatsFormat::Json => println!("{}", serde_json::to_string_pretty(&counts)?),
        StatsFormat::Prometheus => {
            init_metrics()?;
            MetricsCollector::new().record_queue_counts(&counts);
            print!("{}", export_metrics());
        }
    }
    Ok(())
}

fn render_stats_table(counts: &StatusCounts) -> String {
    let mut out = String::new();
    out.push_str(&format!("{:<12} {:>10}\n", "STATUS", "COUNT"));
    for status in EntryStatus::ALL {
        out.push_str(&format!("{:<12} {:>10}\n", status.as_str(), counts.get(status)));
    }
    out.push_str(&format!("{:<12} {:>10}\n", "exhausted", counts.exhausted));
    out.push_str(&format!("{:<12} {:>10}\n", "total", counts.total()));
    out
}

async fn run_show_command(settings: Settings, args: ShowArgs) -> anyhow::Result<()> {
    let store = storage::connect(&settings.database_url, settings.queue(), None).await?;
    let entry = store.get(args.id).await;
    store.close().await;

    let entry: QueueEntry = entry?.with_context(|| format!("Entry {} not found", args.id))?;
    println!("{}", serde_json::to_string_pretty(&entry)?);
    Ok(())
}

// ============================================================================
// Dispatcher
// ============================================================================

async fn run_dispatch_command(mut settings: Settings, args: DispatchArgs) -> anyhow::Result<()> {
    if let Some(batch_size) = args.batch_size {
        settings.batch_size = batch_size;
    }
    if let Some(max_workers) = args.max_workers {
        settings.max_workers = max_workers;
    }
    if let Some(launcher) = args.launcher {
        settings.launcher = launcher;
    }
    if args.retry_failed {
        settings.retry_failed = true;
    }
    settings.validate()?;

    // The dispatcher only needs queue credentials, never client certificates.
    let provisioned = settings
        .provision()
        .with_cert_source(CertSource::None)
        .with_client_cert_required(false)
        .provision()
        .await
        .context("Failed to provision dispatcher credentials")?;

    let store = storage::connect(
        &settings.database_url,
        settings.queue(),
        provisioned.credentials.as_ref(),
    )
    .await?;
    let launcher = build_launcher(&settings.launcher())?;
    let dispatcher = Dispatcher::new(store.clone(), launcher, settings.dispatcher());

    if args.run_loop {
        let (trigger, shutdown) = shutdown::channel();
        let _signals = spawn_signal_listener(trigger);

        let metrics_server = match args.metrics_addr {
            Some(addr) => Some(start_metrics_server(addr, shutdown.clone()).await?),
            None => None,
        };

        dispatcher.run_forever(shutdown).await;
        store.close().await;

        if let Some(server) = metrics_server {
            if let Err(e) = server.await? {
                warn!(error = %e, "Metrics server failed");
            }
        }
        return Ok(());
    }

    let report = dispatcher.run_cycle().await;
    store.close().await;
    let report = report?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_dispatch_report(&report);
    }
    Ok(())
}

async fn start_metrics_server(
    addr: SocketAddr,
    shutdown: Shutdown,
) -> anyhow::Result<JoinHandle<std::io::Result<()>>> {
    init_metrics().context("Failed to initialize metrics")?;
    let server = MetricsServer::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics address {addr}"))?;
    Ok(server.spawn(shutdown))
}

fn print_dispatch_report(report: &DispatchReport) {
    println!("Pending entries:     {}", report.pending_entries);
    println!("Stale entries reset: {}", report.stale_entries_reset);
    if report.requeued_failed > 0 {
        println!("Failed requeued:     {}", report.requeued_failed);
    }
    println!("Workers launched:    {}", report.workers_launched);
    if report.launch_failures > 0 {
        println!("Launch failures:     {}", report.launch_failures);
    }
    for worker in &report.workers {
        println!("  {}  {}", worker.handle, worker.owner);
    }
}

// ============================================================================
// Worker
// ============================================================================

async fn run_work_command(mut settings: Settings, args: WorkArgs) -> anyhow::Result<()> {
    if let Some(batch_size) = args.batch_size {
        settings.batch_size = batch_size;
    }
    if args.allow_plaintext {
        settings.allow_plaintext = true;
    }
    settings.validate()?;

    let owner = args
        .owner_id
        .or_else(|| settings.owner_id.clone())
        .unwrap_or_else(|| new_owner_id(&settings.environment));

    let (trigger, shutdown) = shutdown::channel();
    let _signals = spawn_signal_listener(trigger);

    // Provisioning failures end the worker before it claims anything.
    let provisioned = settings
        .provision()
        .provision()
        .await
        .map_err(WorkerError::from)?;

    let store = storage::connect(
        &settings.database_url,
        settings.queue(),
        provisioned.credentials.as_ref(),
    )
    .await
    .map_err(WorkerError::from)?;

    let processor = match HttpProcessor::new(
        &settings.endpoint_url,
        settings.call_timeout,
        provisioned.tls.as_ref(),
    ) {
        Ok(processor) => processor,
        Err(e) => {
            store.close().await;
            return Err(WorkerError::from(e).into());
        }
    };

    info!(owner = %owner, batch_size = settings.batch_size, "Worker starting");
    let worker = Worker::new(store.clone(), Arc::new(processor), settings.worker(&owner));
    let outcome = worker.run(shutdown).await;
    store.close().await;
    drop(provisioned);

    let outcome = outcome?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else if let WorkerOutcome::Processed(summary) = &outcome {
        info!(
            owner = %owner,
            completed = summary.completed,
            claimed = summary.claimed,
            "Processing complete"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_dispatch_loop() {
        let cli = Cli::try_parse_from([
            "queue-dispatch",
            "dispatch",
            "--loop",
            "--max-workers",
            "5",
            "--launcher",
            "process",
            "--metrics-addr",
            "127.0.0.1:9464",
        ])
        .unwrap();

        match cli.command {
            Commands::Dispatch(args) => {
                assert!(args.run_loop);
                assert_eq!(args.max_workers, Some(5));
                assert_eq!(args.metrics_addr, Some("127.0.0.1:9464".parse().unwrap()));
                assert_eq!(args.launcher, Some(LauncherKind::Process));
            }
            _ => panic!("expected dispatch"),
        }
    }

    #[test]
    fn test_parse_stats_format() {
        let cli =
            Cli::try_parse_from(["queue-dispatch", "stats", "--format", "prometheus"]).unwrap();
        match cli.command {
            Commands::Stats(args) => assert_eq!(args.format, StatsFormat::Prometheus),
            _ => panic!("expected stats"),
        }
    }

    #[test]
    fn test_enqueue_payload_and_file_conflict() {
        let result = Cli::try_parse_from([
            "queue-dispatch",
            "enqueue",
            "--payload",
            "{}",
            "--file",
            "entries.jsonl",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_read_payloads_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("entries.jsonl");
        std::fs::write(&path, "{\"n\":1}\n\n{\"n\":2}\n").unwrap();

        let args = EnqueueArgs {
            payload: None,
            file: Some(path.clone()),
            json: false,
        };
        let payloads = read_payloads(&args).unwrap();
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[1]["n"], 2);

        std::fs::write(&path, "{\"n\":1}\nnot json\n").unwrap();
        let err = read_payloads(&args).unwrap_err();
        assert!(err.to_string().contains(":2"));
    }

    #[test]
    fn test_render_stats_table() {
        let table = render_stats_table(&StatusCounts {
            pending: 2,
            processing: 1,
            completed: 7,
            failed: 1,
            exhausted: 0,
        });
        assert!(table.contains("completed"));
        assert!(table.lines().last().unwrap().contains("11"));
    }
}
