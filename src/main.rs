use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use offloader::config::AppConfig;
use offloader::context::AppContext;
use offloader::core::notifications::{format_duration, human_size};
use offloader::core::transfer_engine::CopierType;
use offloader::core::{JobRecord, ProgressSnapshot};
use offloader::logging::{self, LogConfig};
use offloader::rpc::{MethodHandler, RpcClient, RpcServer};
use offloader::web::WebServer;
use offloader::db;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// How long a running transfer gets to wind down on SIGINT/SIGTERM.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "offloader")]
#[command(about = "Offload camera media to network storage", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon
    Daemon(ServerArgs),
    /// Show the daemon and transfer status
    Status,
    /// Start offloading into a project folder
    Start {
        project: String,
        /// Only offload this folder of the source drive
        #[arg(long)]
        subfolder: Option<String>,
    },
    /// Cancel the running transfer
    Cancel,
    /// Acknowledge a finished transfer so a new one can start
    Clear,
    /// List the files a transfer would copy from the source drive
    Files {
        /// Only list this folder of the source drive
        #[arg(long)]
        subfolder: Option<String>,
    },
    /// Measure write throughput to the destination share
    SpeedTest,
}

#[derive(Args, Serialize)]
struct ServerArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    rpc_bind: Option<SocketAddr>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    http_bind: Option<SocketAddr>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    copy_engine: Option<CopierType>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    simulation: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    log_json: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.command {
        Commands::Daemon(args) => AppConfig::new(Some(args))?,
        _ => AppConfig::new(None::<&ServerArgs>)?,
    };

    match cli.command {
        Commands::Daemon(_) => run_daemon(config).await.context("Daemon failed")?,
        Commands::Status => run_status(&config).await.context("Failed to check status of daemon")?,
        Commands::Start { project, subfolder } => {
            run_start(&config, project, subfolder).await.context("Failed to start transfer")?
        }
        Commands::Cancel => run_cancel(&config).await.context("Failed to cancel transfer")?,
        Commands::Clear => run_clear(&config).await.context("Failed to clear transfer")?,
        Commands::Files { subfolder } => {
            run_files(&config, subfolder).await.context("Failed to list source files")?
        }
        Commands::SpeedTest => run_speed_test(&config).await.context("Speed test failed")?,
    }

    Ok(())
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    logging::init(LogConfig::from(&config));
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config.config_path.display(),
        simulation = config.simulation,
        "Starting offloader"
    );

    let db_conn = db::init(&config.database_path()).await?;
    let ctx = AppContext::new(config, db_conn);
    let handler = Arc::new(MethodHandler::new(ctx.clone()));
    let shutdown = CancellationToken::new();

    let monitor = tokio::spawn(ctx.drives.clone().run(
        ctx.probe.clone(),
        ctx.config.drive_poll_interval(),
        shutdown.clone(),
    ));
    let rpc = RpcServer::new(handler.clone(), ctx.config.rpc_bind, shutdown.clone());
    let web = WebServer::new(handler, ctx.config.http_bind, shutdown.clone());
    let mut rpc_task = tokio::spawn(async move { rpc.start().await });
    let mut web_task = tokio::spawn(async move { web.start().await });

    let outcome = tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            Ok(())
        }
        result = &mut rpc_task => server_exit("RPC server", result),
        result = &mut web_task => server_exit("Web server", result),
    };

    shutdown.cancel();
    ctx.orchestrator.shutdown(SHUTDOWN_GRACE).await;
    for task in [rpc_task, web_task] {
        if !task.is_finished() {
            let _ = task.await;
        }
    }
    let _ = monitor.await;

    info!("Offloader stopped");
    outcome
}

fn server_exit(
    name: &str,
    result: Result<Result<()>, tokio::task::JoinError>,
) -> Result<()> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!(server = name, error = %e, "Server failed");
            Err(e.context(format!("{} failed", name)))
        }
        Err(e) => Err(anyhow::anyhow!("{} panicked: {}", name, e)),
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        if let Ok(mut term) = signal(SignalKind::terminate()) {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
            return;
        }
    }
    let _ = tokio::signal::ctrl_c().await;
}

#[derive(Deserialize)]
struct DaemonStatus {
    version: String,
    uptime_secs: u64,
    simulation: bool,
}

async fn run_status(config: &AppConfig) -> Result<()> {
    let client = RpcClient::new(config.rpc_bind);
    let status: DaemonStatus = client.call_no_params("daemon.status").await?;
    let snapshot: ProgressSnapshot = client.call_no_params("transfer.current").await?;

    println!(
        "offloader {} up {}{}",
        status.version,
        format_duration(status.uptime_secs),
        if status.simulation { " (simulation)" } else { "" }
    );
    print_snapshot(&snapshot);

    if snapshot.state.is_terminal() || snapshot.job_id.is_none() {
        let last: Option<JobRecord> = client.call_no_params("transfer.last").await?;
        if let Some(record) = last {
            print_record(&record);
        }
    }
    Ok(())
}

async fn run_start(config: &AppConfig, project: String, subfolder: Option<String>) -> Result<()> {
    #[derive(Deserialize)]
    struct Started {
        job_id: String,
    }

    let client = RpcClient::new(config.rpc_bind);
    let started: Started = client
        .call(
            "transfer.start",
            Some(json!({ "project": project, "source_subfolder": subfolder })),
        )
        .await?;
    println!("Started transfer {} for {}", started.job_id, project);
    Ok(())
}

async fn run_cancel(config: &AppConfig) -> Result<()> {
    let client = RpcClient::new(config.rpc_bind);
    let _: serde_json::Value = client.call_no_params("transfer.cancel").await?;
    println!("Cancellation requested; the current file will finish first");
    Ok(())
}

async fn run_clear(config: &AppConfig) -> Result<()> {
    let client = RpcClient::new(config.rpc_bind);
    let cleared: Option<JobRecord> = client.call_no_params("transfer.clear").await?;
    match cleared {
        Some(record) => {
            println!("Cleared:");
            print_record(&record);
        }
        None => println!("Nothing to clear"),
    }
    Ok(())
}

async fn run_files(config: &AppConfig, subfolder: Option<String>) -> Result<()> {
    #[derive(Deserialize)]
    struct Entry {
        relative_path: PathBuf,
        size: u64,
    }
    #[derive(Deserialize)]
    struct Listing {
        files: Vec<Entry>,
        total_bytes: u64,
    }

    let client = RpcClient::new(config.rpc_bind);
    let listing: Listing = client
        .call("drives.files", Some(json!({ "source_subfolder": subfolder })))
        .await?;
    for entry in &listing.files {
        println!("{:>10}  {}", human_size(entry.size as f64), entry.relative_path.display());
    }
    println!(
        "{} files, {}",
        listing.files.len(),
        human_size(listing.total_bytes as f64)
    );
    Ok(())
}

async fn run_speed_test(config: &AppConfig) -> Result<()> {
    #[derive(Deserialize)]
    struct Report {
        destination: String,
        bytes_written: u64,
        elapsed_secs: f64,
        bytes_per_sec: f64,
    }

    let client = RpcClient::new(config.rpc_bind);
    let report: Report = client.call_no_params("nas.speed_test").await?;
    println!(
        "{}: wrote {} in {:.1}s ({}/s)",
        report.destination,
        human_size(report.bytes_written as f64),
        report.elapsed_secs,
        human_size(report.bytes_per_sec)
    );
    Ok(())
}

fn print_snapshot(s: &ProgressSnapshot) {
    let Some(job_id) = &s.job_id else {
        println!("No transfer in progress");
        return;
    };

    println!(
        "{} [{}] {}",
        s.project.as_deref().unwrap_or("-"),
        s.state,
        job_id
    );
    println!(
        "  {:.1}%  {} / {}  files {}/{}",
        s.percent,
        human_size(s.bytes_copied as f64),
        human_size(s.bytes_total as f64),
        s.files_processed,
        s.files_total
    );
    if s.throughput_bps > 0.0 {
        println!(
            "  {}/s  eta {}",
            human_size(s.throughput_bps),
            s.eta_secs.map(format_duration).unwrap_or_else(|| "-".to_string())
        );
    }
    if let Some(file) = &s.current_file {
        println!("  copying {}", file);
    }
    if s.error_count > 0 {
        println!(
            "  {} error(s), last: {}",
            s.error_count,
            s.last_error.as_deref().unwrap_or("-")
        );
    }
}

fn print_record(r: &JobRecord) {
    println!(
        "Last transfer: {} [{}] {} files, {} in {}",
        r.project,
        r.state,
        r.files_copied,
        human_size(r.bytes_copied as f64),
        format_duration(r.duration_secs)
    );
    if let Some(error) = &r.error {
        println!("  error: {}: {}", error.kind, error.message);
    }
    if r.files_failed + r.files_verify_failed > 0 {
        println!(
            "  {} failed, {} failed verification",
            r.files_failed, r.files_verify_failed
        );
    }
}
