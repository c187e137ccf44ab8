//! nfsvold - NFS volume plugin daemon.
//!
//! Serves the Docker volume plugin protocol on one address and the process
//! administration endpoints on another.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use nfsvol::invoker::ProcessGroupInvoker;
use nfsvol::mountchecker::ProcMountChecker;
use nfsvol::mounter::{DEFAULT_MAPFS_PATH, MapfsConfig, MapfsMounter, default_mask};
use nfsvol::os::OsFileSystem;
use nfsvol::resolver::LdapIdResolver;
use nfsvol::{DriverAdmin, VolumeDriver};
use nfsvol_common::DriverPaths;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;

/// Name under which the plugin registers itself.
const DRIVER_NAME: &str = "nfsv3driver";

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// host:port to serve volume management functions
    #[arg(long, env = "NFSVOL_LISTEN_ADDR", default_value = "127.0.0.1:7589")]
    listen_addr: String,

    /// host:port to serve process admin functions
    #[arg(long, env = "NFSVOL_ADMIN_ADDR", default_value = "127.0.0.1:7590")]
    admin_addr: String,

    /// Directory where volumes are mounted
    #[arg(long, env = "NFSVOL_MOUNT_DIR", default_value = "/tmp/volumes")]
    mount_dir: PathBuf,

    /// Path to the mapfs binary
    #[arg(long, env = "NFSVOL_MAPFS_PATH", default_value = DEFAULT_MAPFS_PATH)]
    mapfs_path: String,

    /// Directory where the driver spec file is written
    #[arg(long, env = "NFSVOL_DRIVERS_PATH")]
    drivers_path: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let fmt_layer = match args.log_format {
        LogFormat::Text => tracing_subscriber::fmt::layer().boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(fmt_layer)
        .init();

    tracing::info!(mount_dir = %args.mount_dir.display(), "nfsvold start");

    let ldap = config::ldap_from_env().context("Invalid LDAP configuration")?;

    let mut mounter = MapfsMounter::new(
        Arc::new(ProcessGroupInvoker::new()),
        Arc::new(OsFileSystem),
        Arc::new(ProcMountChecker::new()),
        default_mask().context("Invalid mount option mask")?,
        MapfsConfig::new().with_mapfs_path(&args.mapfs_path),
    );
    if let Some(ldap) = ldap {
        mounter = mounter.with_resolver(Arc::new(LdapIdResolver::new(ldap)));
    }

    let driver = Arc::new(VolumeDriver::new(
        DriverPaths::with_mount_root(&args.mount_dir),
        Arc::new(mounter),
    ));

    if let Some(dir) = &args.drivers_path {
        let path = write_driver_spec(dir, &args.listen_addr)
            .with_context(|| format!("Failed to write driver spec to {}", dir.display()))?;
        tracing::info!(path = %path.display(), "Wrote driver spec");
    }

    let shutdown = CancellationToken::new();
    let admin = Arc::new(DriverAdmin::new());
    admin.set_server_process(Arc::new(shutdown.clone()));
    admin.register_drainable(driver.clone());

    let signals = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            () = shutdown_signal() => signals.cancel(),
            () = signals.cancelled() => {}
        }
    });

    let plugin_listener = TcpListener::bind(&args.listen_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", args.listen_addr))?;
    let admin_listener = TcpListener::bind(&args.admin_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", args.admin_addr))?;

    tracing::info!(
        listen_addr = %args.listen_addr,
        admin_addr = %args.admin_addr,
        "nfsvold started"
    );

    let plugin_server = axum::serve(plugin_listener, api::plugin::router(driver))
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());
    let admin_server = axum::serve(admin_listener, api::admin::router(admin))
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());

    let result = tokio::try_join!(
        async { plugin_server.await.context("Plugin server failed") },
        async { admin_server.await.context("Admin server failed") },
    );
    // Releases the signal listener.
    shutdown.cancel();
    result?;

    tracing::info!("nfsvold end");
    Ok(())
}

/// Write `<dir>/nfsv3driver.spec` advertising `listen_addr`.
fn write_driver_spec(dir: &Path, listen_addr: &str) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{DRIVER_NAME}.spec"));
    std::fs::write(&path, format!("http://{listen_addr}"))?;
    Ok(path)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received SIGINT"),
        () = terminate => tracing::info!("Received SIGTERM"),
    }
}
