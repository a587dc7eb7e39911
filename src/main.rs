//! qfs - Fault-Injecting Passthrough Filesystem
//!
//! Mounts ORIGINAL at MOUNTPOINT through FUSE and serves the fault control
//! plane over HTTP.
//!
//! ```bash
//! qfs /mnt/qfs /data/real --log-dir /var/log/qfs
//! curl -X POST localhost:32768/status -d '{"pre_write": 5}'
//! ```

use clap::Parser;
use qfs::control::{self, CONTROL_BIND_ADDRESS_DEFAULT};
use qfs::fuse::{self, MountConfig};
use qfs::{logging, Config, FaultHook, FaultStore, HookedFs, APP_NAME, APP_VERSION};
use std::sync::Arc;

// =============================================================================
// CLI
// =============================================================================

/// Fault-injecting passthrough filesystem
#[derive(Parser, Debug)]
#[command(name = APP_NAME)]
#[command(about = "Fault-injecting passthrough filesystem with an HTTP control plane")]
#[command(version)]
struct Cli {
    /// Where to mount the hooked filesystem
    mountpoint: String,

    /// Real directory to proxy
    original: String,

    /// Control plane bind address
    #[arg(short, long, default_value = CONTROL_BIND_ADDRESS_DEFAULT)]
    bind: String,

    /// Append logs to <LOG_DIR>/qfs.log instead of stderr
    #[arg(long)]
    log_dir: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Allow other users to access the mount
    #[arg(long)]
    allow_other: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG may come from .env
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let config = Config::new(&cli.mountpoint, &cli.original, &cli.bind)?
        .log_dir(cli.log_dir.as_deref())
        .allow_other(cli.allow_other);

    logging::init(cli.verbose, config.log_dir.as_deref())?;
    tracing::info!("qfs v{}", APP_VERSION);

    let store = FaultStore::shared();
    let hook = FaultHook::new(Arc::clone(&store));
    let fs = Arc::new(HookedFs::new(config.original.clone(), hook));

    let listener = tokio::net::TcpListener::bind(config.bind).await?;

    let session = fuse::spawn_mount(
        fs,
        &config.mountpoint,
        &MountConfig {
            allow_other: config.allow_other,
        },
        tokio::runtime::Handle::current(),
    )?;
    tracing::info!(
        mountpoint = %config.mountpoint.display(),
        "serving; press Ctrl-C to unmount"
    );

    control::serve(listener, store, shutdown_signal()).await?;

    // Dropping the session unmounts
    drop(session);
    tracing::info!(mountpoint = %config.mountpoint.display(), "unmounted");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
