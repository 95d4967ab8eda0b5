mod analyze_cmd;
mod api;
mod config_cmd;
mod results_cmd;
mod services;
mod settings;
mod status_cmd;
mod terminal_output;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use deepeyes_ingest::DirectoryWatcher;
use deepeyes_store::EventRecorder;

use api::AppState;
use services::Services;
use settings::Settings;

#[derive(Parser)]
#[command(name = "deepeyes")]
#[command(about = "DeepEyes: durable image analysis with description and OCR")]
#[command(version)]
struct Cli {
    /// Config file (default: $DEEPEYES_CONFIG_DIR/config.yaml or ~/.deepeyes/config.yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API, the upload watcher and resume unfinished instances
    Serve {
        /// Port to bind the HTTP server to
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Analyse one image (local path or http(s) URL) and print its result
    Analyze {
        target: String,
    },
    /// Print stored analysis results
    Results {
        #[arg(long)]
        json: bool,
    },
    /// Print recent workflow instances
    Instances {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Query a running server's health endpoint
    Status,
    /// Write a default config file
    Init {
        #[arg(long)]
        force: bool,
    },
    /// Print the effective config with secrets redacted
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init { force } = cli.command {
        let path = cli
            .config
            .unwrap_or_else(|| deepeyes_config::config_file_path(&deepeyes_config::config_dir()));
        return config_cmd::init(&path, force).await;
    }

    let settings = Settings::load(cli.config).await?;
    deepeyes_logging::init_logger(&settings.log_options());

    match cli.command {
        Commands::Serve { port } => {
            settings.ensure_valid(true)?;
            run_server(settings, port).await?;
        }
        Commands::Analyze { target } => {
            settings.ensure_valid(true)?;
            let services = Services::open(&settings)?;
            let recorder = spawn_recorder(&services);
            let outcome = analyze_cmd::run(&services, &target).await;
            services.orchestrator.shutdown().await;
            recorder.abort();
            outcome?;
        }
        Commands::Results { json } => {
            settings.ensure_valid(false)?;
            let (results, _) = Services::open_readonly(&settings)?;
            results_cmd::run_results(results.as_ref(), json).await?;
        }
        Commands::Instances { limit, json } => {
            settings.ensure_valid(false)?;
            let (_, checkpoints) = Services::open_readonly(&settings)?;
            results_cmd::run_instances(checkpoints.as_ref(), limit, json).await?;
        }
        Commands::Status => {
            status_cmd::run(&settings.config.server.bind, settings.config.server.port).await?;
        }
        Commands::Config => config_cmd::show(&settings)?,
        Commands::Init { force } => config_cmd::init(&settings.config_path, force).await?,
    }

    Ok(())
}

/// Persist and log every runtime event.
fn spawn_recorder(services: &Services) -> tokio::task::JoinHandle<()> {
    let recorder = EventRecorder::new(services.events.clone());
    let rx = services.orchestrator.subscribe();
    tokio::spawn(async move {
        if let Err(e) = recorder.run(rx).await {
            error!(error = %e, "Event recorder failed");
        }
    })
}

async fn run_server(settings: Settings, port: Option<u16>) -> Result<()> {
    let mut server = settings.config.server.clone();
    if let Some(port) = port {
        server.port = port;
    }
    info!(
        addr = %server.address(),
        db = %settings.database_path().display(),
        config = %settings.config_path.display(),
        "Starting DeepEyes"
    );

    let services = Services::open(&settings)?;
    let recorder = spawn_recorder(&services);

    let resumed = services.orchestrator.resume_unfinished().await?;
    if resumed > 0 {
        info!(count = resumed, "Resumed instances left unfinished by a previous run");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let watcher_handle = settings.config.ingest.watch_dir.as_ref().map(|dir| {
        let interval = Duration::from_millis(settings.config.ingest.scan_interval_ms.max(100));
        let watcher = DirectoryWatcher::new(dir, interval);
        tokio::spawn(watcher.run(services.trigger.clone(), shutdown_rx.clone()))
    });
    if watcher_handle.is_none() {
        warn!("ingest.watchDir not set; uploads arrive only through POST /api/ingest");
    }
    let sweep_handle = match settings.config.workflow.resume_sweep_secs {
        0 => None,
        secs => Some(tokio::spawn(resume_sweep(
            services.clone(),
            Duration::from_secs(secs),
            shutdown_rx.clone(),
        ))),
    };

    let app_state = Arc::new(AppState { services: services.clone() });
    let mut app = api::build_router(app_state).layer(TraceLayer::new_for_http());
    if server.cors {
        app = app.layer(CorsLayer::permissive());
    }

    let listener = TcpListener::bind(server.address())
        .await
        .with_context(|| format!("Failed to bind {}", server.address()))?;
    info!(addr = %server.address(), "HTTP API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    let _ = shutdown_tx.send(true);
    if let Some(handle) = watcher_handle {
        let _ = handle.await;
    }
    if let Some(handle) = sweep_handle {
        let _ = handle.await;
    }
    services.orchestrator.shutdown().await;
    recorder.abort();
    Ok(())
}

/// Periodically pick up unfinished instances that no process is driving, such
/// as those orphaned by a crashed peer once their lease ran out.
async fn resume_sweep(services: Services, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = services.orchestrator.resume_unfinished().await {
                    warn!(error = %e, "Resume sweep failed");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
