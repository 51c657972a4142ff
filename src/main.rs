//! bucketsync - keep a local folder synchronized into an object-store bucket.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use bucketsync::config::Config;
use bucketsync::logging::init_logging;
use bucketsync::utils::{format_bytes, format_duration};
use bucketsync::{
    scanner,
    S3Client,
    S3Uploader,
    UploadCoordinator,
    UploadRequest,
    UploadSummary,
    UploadTracker,
};

#[derive(Parser, Debug)]
#[command(name = "bucketsync")]
#[command(version)]
#[command(about = "Upload folders to S3-compatible storage and keep them in sync")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (defaults to ./bucketsync.toml when present)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload matching files once and exit
    Upload {
        /// Folder to upload
        source: PathBuf,
        /// Destination bucket
        bucket: String,
        /// Upload id (random when omitted)
        #[arg(short = 'i', long)]
        upload_id: Option<String>,
        /// Glob pattern relative to the source folder
        #[arg(short, long, default_value = "*")]
        pattern: String,
        /// Concurrent file transfers
        #[arg(short, long)]
        workers: Option<usize>,
        /// Directory for state and audit logs
        #[arg(long, value_name = "DIR")]
        log_dir: Option<PathBuf>,
    },
    /// Upload, then keep watching the folder until interrupted
    Start {
        source: PathBuf,
        bucket: String,
        #[arg(short = 'i', long)]
        upload_id: Option<String>,
        #[arg(short, long, default_value = "*")]
        pattern: String,
        /// Display name
        #[arg(short = 'n', long)]
        name: Option<String>,
        /// Upload type tag
        #[arg(short = 't', long = "type")]
        upload_type: Option<String>,
        #[arg(short = 'd', long)]
        description: Option<String>,
    },
    /// Show tracked uploads
    List,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let mut config = Config::load_config(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Upload {
            source,
            bucket,
            upload_id,
            pattern,
            workers,
            log_dir,
        } => {
            if let Some(workers) = workers {
                config.max_workers = workers;
            }
            if let Some(log_dir) = log_dir {
                config.log_dir = log_dir;
            }
            config.validate().context("Invalid configuration")?;

            let upload_id = upload_id.unwrap_or_else(new_upload_id);
            let request = UploadRequest::new(upload_id, source, bucket, pattern).context("Invalid upload request")?;
            upload_once(&config, request).await
        }
        Command::Start {
            source,
            bucket,
            upload_id,
            pattern,
            name,
            upload_type,
            description,
        } => {
            let upload_id = upload_id.unwrap_or_else(new_upload_id);
            let mut request =
                UploadRequest::new(upload_id, source, bucket, pattern).context("Invalid upload request")?;
            if let Some(name) = name {
                request = request.with_name(name);
            }
            if let Some(upload_type) = upload_type {
                request = request.with_type(upload_type);
            }
            if let Some(description) = description {
                request = request.with_description(description);
            }

            run_monitored(&config, request).await
        }
        Command::List => list_uploads(&config).await,
    }
}

fn new_upload_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn s3_client(config: &Config) -> Result<Arc<S3Client>> {
    let client = S3Client::new(config.s3_client_config()).context("Failed to create S3 client")?;
    Ok(Arc::new(client))
}

async fn upload_once(config: &Config, request: UploadRequest) -> Result<ExitCode> {
    let store = s3_client(config)?;
    let tracker = UploadTracker::open(Some(config.log_dir.clone()), Some(config.state_file()))
        .await
        .context("Failed to open upload tracker")?;
    tracker.register_upload(&request).await;

    let files = scanner::scan(&request);
    println!(
        "Uploading {} files from {} to {}",
        files.len(),
        request.source_folder().display(),
        request.destination_bucket()
    );

    let uploader = S3Uploader::new(store, config.uploader_config())
        .with_scope(request.upload_id(), request.source_folder());
    let started = Instant::now();
    let summary = uploader
        .upload_files(files, request.destination_bucket(), request.metadata())
        .await;

    for result in summary.results.iter().filter(|r| r.success) {
        tracker
            .mark_file_complete(request.upload_id(), &result.file_path.to_string_lossy(), result)
            .await;
    }
    tracker.log_upload_summary(&summary).await;

    print_summary(&summary, started.elapsed());
    Ok(if summary.failed_uploads > 0 { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

fn print_summary(summary: &UploadSummary, elapsed: Duration) {
    println!();
    println!("Upload {}", summary.upload_id);
    println!("  Total files: {}", summary.total_files);
    println!("  Successful:  {}", summary.successful_uploads);
    println!("  Failed:      {}", summary.failed_uploads);
    println!("  Transferred: {} in {}", format_bytes(summary.total_bytes()), format_duration(elapsed));

    if summary.failed_uploads > 0 {
        println!();
        println!("Failed uploads:");
        for failure in summary.failures() {
            println!(
                "  {}: {}",
                failure.file_path.display(),
                failure.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
}

async fn run_monitored(config: &Config, request: UploadRequest) -> Result<ExitCode> {
    let store = s3_client(config)?;
    let coordinator = UploadCoordinator::new(config.coordinator_config(), store)
        .await
        .context("Failed to start coordinator")?;

    let upload_id = request.upload_id().to_string();
    if let Some(summary) = coordinator.start_upload(request).await.context("Failed to start upload")? {
        println!(
            "Initial upload: {}/{} files uploaded",
            summary.successful_uploads, summary.total_files
        );
    }

    println!(
        "Monitoring {} every {}s, press Ctrl-C to stop",
        upload_id, config.scan_interval_secs
    );
    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;

    coordinator.stop_all().await;
    Ok(ExitCode::SUCCESS)
}

async fn list_uploads(config: &Config) -> Result<ExitCode> {
    let tracker = UploadTracker::open(Some(config.log_dir.clone()), Some(config.state_file()))
        .await
        .context("Failed to open upload tracker")?;

    let states = tracker.upload_states().await;
    if states.is_empty() {
        println!("No tracked uploads");
    }

    for state in states {
        println!("{}", state.upload_id);
        println!("  Source:      {}", state.source_folder);
        println!("  Bucket:      {}", state.destination_bucket);
        println!("  Pattern:     {}", state.pattern);
        println!("  Completed:   {}", state.completed_files.len());
        println!("  In progress: {}", state.in_progress_files.len());
    }

    Ok(ExitCode::SUCCESS)
}
