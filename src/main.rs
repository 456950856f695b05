use std::env;
use std::process::ExitCode;

use anyhow::{Context, Error};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use queso_jobs::api::Orchestrator;
use queso_jobs::config::ConfigContext;
use queso_jobs::store::JobStore;
use queso_jobs::supervisor::LogEvent;
use queso_jobs::telemetry;
use queso_jobs::worker::WorkerOptions;
use queso_jobs::{JobKind, JobRequest, Status};

#[derive(Parser, Debug)]
#[command(author, version, about = "Launch and supervise external analysis jobs")]
struct Cli {
    #[command(flatten)]
    config: ConfigContext,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Host the supervisors until SIGINT/SIGTERM.
    Serve {
        #[arg(long = "warm-worker", help = "Start the worker and warm it up right away")]
        warm_worker: bool,
    },
    /// Run one batch analysis and follow its log.
    Analyze {
        #[arg(short = 'i', long = "input")]
        input: String,
        #[arg(short = 's', long = "slug")]
        slug: Option<String>,
        #[arg(long = "opts", help = "JSON options passed to the analysis tool")]
        opts: Option<String>,
    },
    /// Fetch media audio and follow the download log.
    Download {
        #[arg(short = 'u', long = "url")]
        url: String,
        #[arg(short = 's', long = "slug")]
        slug: Option<String>,
    },
    /// Print the persisted job tables.
    Jobs,
}

#[instrument(skip_all)]
async fn setup(cli: Cli, cancel_token: CancellationToken) -> Result<ExitCode, Error> {
    let config = cli.config;

    match cli.command {
        Command::Serve { warm_worker } => {
            let orchestrator = Orchestrator::start(&config, cancel_token.clone()).await?;
            if warm_worker {
                let status = orchestrator
                    .ensure_worker_started(WorkerOptions { warmup: true })
                    .await?;
                info!(pid = ?status.pid, port = status.port, "Worker started");
            }
            info!(data_dir = %config.data_dir.display(), "Serving");
            cancel_token.cancelled().await;
            orchestrator.shutdown().await;
            Ok(ExitCode::SUCCESS)
        }
        Command::Analyze { input, slug, opts } => {
            let opts = match opts {
                Some(raw) => serde_json::from_str(&raw).context("--opts is not valid JSON")?,
                None => serde_json::Value::Null,
            };
            let request = JobRequest {
                input: Some(input),
                slug,
                opts,
            };
            follow(&config, cancel_token, JobKind::BatchAnalysis, request).await
        }
        Command::Download { url, slug } => {
            let request = JobRequest {
                input: Some(url),
                slug,
                opts: serde_json::Value::Null,
            };
            follow(&config, cancel_token, JobKind::MediaDownload, request).await
        }
        Command::Jobs => {
            // Read only: a running `serve` owns these tables.
            let jobs = JobStore::load_snapshot(&config.data_dir).await;
            println!("{}", serde_json::to_string_pretty(&jobs)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Create one job, print its log as it arrives and report how it ended.
async fn follow(
    config: &ConfigContext,
    cancel_token: CancellationToken,
    kind: JobKind,
    request: JobRequest,
) -> Result<ExitCode, Error> {
    let orchestrator = Orchestrator::start(config, cancel_token.clone()).await?;
    let created = orchestrator.create_job(kind, request).await?;
    let job_id = created.job_id.to_string();
    info!(job_id = %job_id, slug = %created.slug, "Job created");

    let mut events = orchestrator.stream_logs(&job_id).await?;
    let mut finished = None;
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Follow Cancelled");
                break;
            },
            event = events.next() => {
                match event {
                    Some(LogEvent::Line(entry)) => println!("{}", entry.line),
                    Some(LogEvent::End { status }) => {
                        finished = Some(status);
                        break;
                    },
                    None => break,
                }
            }
        }
    }
    drop(events);

    let job = orchestrator.get_job_status(&job_id).await?;
    println!("{}", serde_json::to_string_pretty(&job)?);
    orchestrator.shutdown().await;

    Ok(if finished == Some(Status::Done) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "queso_jobs=debug");
    }

    let cli = Cli::parse();
    telemetry::init(cli.config.jaeger_endpoint.as_deref())?;

    let token = CancellationToken::new();

    let cloned_token = token.clone();
    let app = tokio::spawn(setup(cli, cloned_token));

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                (Err(err), _) | (_, Err(err)) => {
                    error!("Failed to install signal handlers: {}", err);
                    return;
                }
            };
        tokio::select! {
            _ = sigterm.recv() => {info!("Received SIGTERM"); token.cancel()},
            _ = sigint.recv() => {info!("Received SIGINT"); token.cancel()},
        }
    });

    let code = app.await??;
    info!("Shutting down.");
    telemetry::shutdown();

    Ok(code)
}
