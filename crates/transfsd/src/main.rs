//! transfsd: TransFS daemon
//!
//! Usage:
//!   transfsd [--config /etc/transfs/transfs.toml] [--clients /etc/transfs/clients.toml]
//!
//! Mounts the configured virtual tree and serves it until SIGINT/SIGTERM
//! (or an external `fusermount3 -u <mountpoint>`).

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use transfs_core::Config;
use transfs_vfs::Vfs;

#[derive(Parser, Debug)]
#[command(name = "transfsd", version, about = "TransFS virtual filesystem daemon")]
struct Cli {
    /// Path to the app configuration file
    #[arg(
        long,
        short = 'c',
        env = "TRANSFS_CONFIG",
        default_value = "/etc/transfs/transfs.toml"
    )]
    config: PathBuf,

    /// Path to the clients configuration file
    #[arg(
        long,
        env = "TRANSFS_CLIENTS",
        default_value = "/etc/transfs/clients.toml"
    )]
    clients: PathBuf,

    /// Mountpoint override
    #[arg(long)]
    mountpoint: Option<PathBuf>,

    /// Filestore root override
    #[arg(long)]
    filestore: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long, env = "TRANSFS_LOG")]
    log: Option<String>,

    /// Log format override
    #[arg(long, env = "TRANSFS_LOG_FORMAT")]
    log_format: Option<LogFormat>,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, app_doc_missing) = load_config(&cli).await?;

    if let Some(mountpoint) = &cli.mountpoint {
        config.app.mountpoint = mountpoint.clone();
    }
    if let Some(filestore) = &cli.filestore {
        config.app.filestore = filestore.clone();
    }

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let json = match &cli.log_format {
        Some(LogFormat::Json) => true,
        Some(LogFormat::Text) => false,
        None => config.log.format == "json",
    };
    init_logging(&level, json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        clients = %cli.clients.display(),
        "transfsd starting"
    );
    if app_doc_missing {
        warn!(
            "app config not found: {}  (using defaults)",
            cli.config.display()
        );
    }
    info!(
        mountpoint = %config.app.mountpoint.display(),
        filestore = %config.app.filestore.display(),
        clients = config.clients.len(),
        "configuration loaded"
    );

    tokio::fs::create_dir_all(&config.app.mountpoint)
        .await
        .with_context(|| format!("creating mountpoint: {}", config.app.mountpoint.display()))?;

    let vfs = Arc::new(Vfs::new(Arc::new(config)));

    let mut mount_handle = transfs_fuse::mount(vfs)
        .await
        .context("mounting filesystem")?;

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("installing SIGTERM handler")?;

    let handle = &mut mount_handle;
    tokio::select! {
        res = handle => res.context("FUSE session ended")?,
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, unmounting");
            mount_handle.unmount().await.context("unmounting")?;
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, unmounting");
            mount_handle.unmount().await.context("unmounting")?;
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Read and merge the two config documents. A missing app document falls
/// back to defaults; a missing clients document is a startup error.
async fn load_config(cli: &Cli) -> Result<(Config, bool)> {
    let (app_toml, app_doc_missing) = match tokio::fs::read_to_string(&cli.config).await {
        Ok(content) => (content, false),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => (String::new(), true),
        Err(e) => {
            return Err(anyhow::anyhow!(
                "reading config {}: {e}",
                cli.config.display()
            ))
        }
    };

    let clients_toml = tokio::fs::read_to_string(&cli.clients)
        .await
        .map_err(|e| anyhow::anyhow!("reading clients config {}: {e}", cli.clients.display()))?;

    let config = Config::from_toml(&app_toml, &clients_toml)?;
    Ok((config, app_doc_missing))
}

fn init_logging(level: &str, json: bool) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}
