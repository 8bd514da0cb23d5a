#![forbid(unsafe_code)]

//! Streamforge HTTP server.
//!
//! Boot order: logging, privilege check, settings, worker lookup, artifact
//! directory, listener. Any failure before the listener is up ends the
//! process with a non-zero status.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use streamforge::{
    api::router,
    config::{DEFAULT_WORKER_NAME, RuntimeOverrides, resolve_runtime_settings},
    lifecycle::ServiceContext,
    security::ensure_not_root,
    telemetry::{init_tracing, install_fatal_panic_hook},
    worker::WorkerBinary,
};
use tokio::{net::TcpListener, signal};
use tracing::{error, info, warn};

/// Open connections get this long to finish once shutdown starts.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "streamforge", version, about = "Stream yt-dlp downloads over HTTP")]
struct Args {
    /// Address to bind (STREAMFORGE_HOST).
    #[arg(long)]
    host: Option<String>,
    /// Port to bind (STREAMFORGE_PORT).
    #[arg(long)]
    port: Option<u16>,
    /// Netscape cookie file handed to yt-dlp (STREAMFORGE_COOKIES).
    #[arg(long)]
    cookies: Option<PathBuf>,
    /// Directory for in-flight artifacts (STREAMFORGE_ARTIFACT_DIR).
    #[arg(long)]
    artifact_dir: Option<PathBuf>,
    /// Explicit yt-dlp executable instead of a PATH lookup (STREAMFORGE_WORKER).
    #[arg(long)]
    worker: Option<PathBuf>,
    /// Dotenv file read for defaults.
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl From<Args> for RuntimeOverrides {
    fn from(args: Args) -> Self {
        Self {
            host: args.host,
            port: args.port,
            cookies_file: args.cookies,
            artifact_dir: args.artifact_dir,
            worker: args.worker,
            env_path: args.env_file,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    install_fatal_panic_hook();
    let args = Args::parse();

    ensure_not_root("streamforge")?;

    let settings = resolve_runtime_settings(args.into()).context("resolving settings")?;
    let worker = WorkerBinary::locate(DEFAULT_WORKER_NAME, settings.worker.as_deref())
        .context("locating yt-dlp")?;

    let cookies = if settings.cookies_file.is_file() {
        Some(settings.cookies_file.clone())
    } else {
        warn!(
            path = %settings.cookies_file.display(),
            "cookie file not found, running without cookies"
        );
        None
    };

    tokio::fs::create_dir_all(&settings.artifact_dir)
        .await
        .with_context(|| format!("creating {}", settings.artifact_dir.display()))?;

    let ctx = Arc::new(ServiceContext {
        worker,
        cookies,
        artifact_dir: settings.artifact_dir.clone(),
    });

    let addr = format!("{}:{}", settings.host, settings.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!(
        %addr,
        worker = %ctx.worker.path().display(),
        artifacts = %ctx.artifact_dir.display(),
        "streamforge listening"
    );

    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running HTTP server")?;

    info!("shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM, then arms the forced-exit timer.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!(grace = ?SHUTDOWN_GRACE, "shutdown requested, draining connections");
    tokio::spawn(async {
        tokio::time::sleep(SHUTDOWN_GRACE).await;
        error!("connections still open after grace period, forcing shutdown");
        std::process::exit(1);
    });
}
