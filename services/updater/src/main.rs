//! valheim-updater
//!
//! Runs next to the Valheim server under supervisord. Only one instance may
//! run at a time; the pid file enforces that. SIGHUP triggers an immediate
//! update check, SIGINT/SIGTERM stop the loop after the current step.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};

use valheim_updater::daemon::install_signal_handlers;
use valheim_updater::lock::{self, AcquireOutcome, FileSlot};
use valheim_updater::{logging, Config, ControlFlags, Daemon, Dependencies};

/// Updater version (semver).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            return ExitCode::from(1);
        }
    };

    if let Err(e) = logging::init(config.log_file.as_deref()) {
        eprintln!("Failed to initialize logging: {}", e);
        return ExitCode::from(1);
    }

    info!(version = VERSION, "valheim-updater starting");

    match run(config).await {
        Ok(exit_code) => {
            info!(exit_code, "valheim-updater exiting");
            ExitCode::from(exit_code)
        }
        Err(e) => {
            error!(error = %e, "valheim-updater failed");
            for cause in e.chain().skip(1) {
                error!(cause = %cause, "caused by");
            }
            ExitCode::from(1)
        }
    }
}

async fn run(config: Config) -> Result<u8> {
    // Handlers must be in place before the lock file exists
    let flags = Arc::new(ControlFlags::new());
    let _signals =
        install_signal_handlers(Arc::clone(&flags)).context("failed to install signal handlers")?;

    let slot = Arc::new(FileSlot::new(&config.pid_file));
    let pid = std::process::id();

    let lock = match lock::acquire(slot, pid, lock::process_alive)
        .with_context(|| format!("failed to access lock {}", config.pid_file.display()))?
    {
        AcquireOutcome::Acquired(handle) => handle,
        AcquireOutcome::Busy { owner } => {
            info!(pid = owner, "updater is already running");
            return Ok(0);
        }
        AcquireOutcome::Stale { owner } => {
            error!(
                lock = %config.pid_file.display(),
                owner = ?owner,
                "found stale lock file; remove it once no other updater is running"
            );
            return Ok(1);
        }
    };
    info!(pid, lock = %lock.location(), "lock acquired");

    info!(
        interval_secs = config.update_interval.as_secs(),
        update_if_idle = config.update_if_idle,
        addons = ?config.addons.iter().filter(|a| a.enabled).map(|a| a.name.as_str()).collect::<Vec<_>>(),
        "configuration loaded"
    );

    let mut daemon = Daemon::new(&config, Dependencies::system(&config), flags);
    daemon.run().await;

    lock.release().context("failed to remove lock file")?;
    Ok(0)
}
