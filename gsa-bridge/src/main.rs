use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use gsa_bridge::config::{ConfigStore, DEFAULT_WATCH_INTERVAL, spawn_config_watcher};
use gsa_bridge::connector::DirectoryConnector;
use gsa_bridge::orchestrator::Orchestrator;
use gsa_bridge::push::LoggingFeedSink;
use gsa_bridge::{logging, panic_hook};

/// Time in-flight requests get when the process shuts down.
const SHUTDOWN_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug, Parser)]
#[command(name = "gsa-bridge", version, about = "Serve a directory tree to a search appliance crawler")]
struct Args {
    /// Configuration file (java properties format)
    #[arg(short, long, env = "GSA_BRIDGE_CONFIG", default_value = "adaptor-config.properties")]
    config: PathBuf,

    /// Directory for daily log files
    #[arg(long, env = "GSA_BRIDGE_LOG_DIR", default_value = "logs")]
    log_dir: String,

    /// Root of the directory tree to serve
    #[arg(short, long, env = "GSA_BRIDGE_ROOT", default_value = ".")]
    root: PathBuf,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    match run(args).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            error!("Application error: {e:#}");
            eprintln!("Error: {e:#}");
            process::exit(1);
        }
    }
}

async fn run(args: Args) -> anyhow::Result<i32> {
    let (logging, _guard) =
        logging::init_logging(&args.log_dir).context("Failed to initialize logging")?;
    panic_hook::install(&args.log_dir);

    let background = CancellationToken::new();
    logging.start_retention_cleanup(background.clone());

    let config = Arc::new(ConfigStore::new());
    config
        .load_file(&args.config)
        .await
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    let connector = Arc::new(DirectoryConnector::new(args.root.clone()));
    let orchestrator = Orchestrator::builder(config.clone(), connector)
        .feed_sink(Arc::new(LoggingFeedSink))
        .logging(logging)
        .build();
    let mut fatal = orchestrator.subscribe_fatal();

    let signalled = CancellationToken::new();
    tokio::spawn({
        let signalled = signalled.clone();
        async move {
            shutdown_signal().await;
            signalled.cancel();
        }
    });

    // A signal during connector init retries aborts the start, which then
    // tears down what it already brought up.
    let start = orchestrator.start();
    tokio::pin!(start);
    let started = tokio::select! {
        result = &mut start => result,
        _ = signalled.cancelled() => {
            orchestrator.begin_shutdown();
            start.await
        }
    };
    if let Err(e) = started {
        background.cancel();
        return match e {
            gsa_bridge::Error::ShuttingDown => {
                info!("Shut down during startup");
                Ok(0)
            }
            e => Err(e).context("Failed to start"),
        };
    }

    info!(root = %args.root.display(), "gsa-bridge started");
    if config.snapshot().push_doc_ids_on_startup()? {
        orchestrator.check_and_schedule_immediate_push_of_doc_ids();
    }

    spawn_config_watcher(config.clone(), DEFAULT_WATCH_INTERVAL, background.clone());

    let code = tokio::select! {
        _ = signalled.cancelled() => {
            info!("Shutdown signal received");
            0
        }
        changed = fatal.wait_for(Option::is_some) => {
            match changed {
                Ok(err) => {
                    if let Some(err) = &*err {
                        error!(error = %err, "Stopping after failed restart");
                    }
                }
                Err(_) => warn!("Fatal error channel closed"),
            }
            1
        }
    };

    orchestrator.begin_shutdown();
    orchestrator.stop(SHUTDOWN_DELAY).await;
    background.cancel();
    info!("gsa-bridge stopped");
    Ok(code)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
