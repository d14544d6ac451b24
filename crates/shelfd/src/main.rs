//! shelfd - unified manga library daemon binary.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use mimalloc::MiMalloc;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use shelf_core::config::{bootstrap, BootstrapError, ValidationProfile};
use shelfd::supervisor::TokioSignals;
use shelfd::{build_event_log, preflight_fuse_device, Daemon};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Unified manga library supervisor daemon.
#[derive(Debug, Parser)]
#[command(name = "shelfd", version, about)]
struct Cli {
    /// Configuration root holding settings.yml and the catalog documents.
    config_root: PathBuf,

    /// Validate the configuration and exit without starting the daemon.
    #[arg(long)]
    check: bool,
}

fn main() {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Err(message) = preflight_fuse_device() {
        eprintln!("{message}");
        std::process::exit(1);
    }

    let bundle = match bootstrap(&cli.config_root, ValidationProfile::StrictRuntime) {
        Ok(bundle) => bundle,
        Err(BootstrapError::Validation(errors)) => {
            eprintln!("configuration at {} is invalid:", cli.config_root.display());
            for error in &errors {
                eprintln!("{error}");
            }
            std::process::exit(1);
        }
        Err(err) => {
            eprintln!("configuration bootstrap failed: {err}");
            std::process::exit(1);
        }
    };
    for warning in &bundle.warnings {
        info!("bootstrap: {warning}");
    }

    if cli.check {
        println!("configuration at {} is valid", cli.config_root.display());
        return;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    let code = runtime.block_on(async {
        let log = build_event_log(&bundle);
        match Daemon::new(&bundle, log) {
            Ok(daemon) => daemon.run(Arc::new(TokioSignals)).await,
            Err(err) => {
                error!("failed to initialize daemon: {err:#}");
                1
            }
        }
    });

    std::process::exit(code);
}
