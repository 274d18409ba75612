//! Server download and install.
//!
//! SteamCMD downloads into a staging directory, which is then mirrored onto
//! the live server directory with rsync. The live tree only changes through
//! the mirror, so a half-finished download never lands under a running server.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Result, UpdaterError};
use crate::process::{CommandSpec, Launcher};

/// Steam application id of the dedicated server.
pub const VALHEIM_APP_ID: &str = "896660";

/// Server executable, used to tell whether a usable copy exists.
pub const SERVER_BINARY: &str = "valheim_server.x86_64";

/// Paths in the live tree the mirror must leave alone.
pub const SYNC_EXCLUDES: [&str; 2] = ["server_exit.drp", "steamapps"];

/// Outcome of a fetch that did not abort the cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchResult {
    /// SteamCMD succeeded.
    pub success: bool,
    /// The live tree changed.
    pub changed: bool,
}

pub struct Fetcher {
    launcher: Arc<dyn Launcher>,
    steamcmd: String,
    rsync: String,
    extra_args: Vec<String>,
    download_path: PathBuf,
    install_path: PathBuf,
}

impl Fetcher {
    pub fn new(config: &Config, launcher: Arc<dyn Launcher>) -> Self {
        Self {
            launcher,
            steamcmd: config.steamcmd_path.clone(),
            rsync: config.rsync_path.clone(),
            extra_args: config.steamcmd_args.clone(),
            download_path: config.download_path.clone(),
            install_path: config.install_path.clone(),
        }
    }

    /// Download the latest build and install it.
    ///
    /// `env` is added to the SteamCMD environment. Fails only when SteamCMD
    /// failed and no server binary exists anywhere.
    pub async fn fetch(&self, env: &[(String, String)]) -> Result<FetchResult> {
        let staged = self.download_path.join(SERVER_BINARY);
        if staged.is_file() {
            info!("downloading/updating/validating server from steam");
        } else {
            info!(path = %self.download_path.display(), "server not yet downloaded, downloading from steam");
        }

        let mut spec = CommandSpec::new(&self.steamcmd)
            .arg("+force_install_dir")
            .arg(self.download_path.display().to_string())
            .args(["+login", "anonymous", "+app_update", VALHEIM_APP_ID])
            .args(self.extra_args.iter().cloned())
            .arg("+quit");
        for (key, value) in env {
            spec = spec.env(key, value);
        }

        let exit_code = match self.launcher.run(&spec).await {
            Ok(output) => output.exit_code,
            Err(e) => {
                warn!(error = %e, "failed to launch steamcmd");
                None
            }
        };

        if exit_code == Some(0) {
            let changed = self.sync().await?;
            return Ok(FetchResult {
                success: true,
                changed,
            });
        }

        if staged.is_file() {
            error!(
                exit_code = ?exit_code,
                "failed to update server from steam, using previously downloaded version"
            );
            self.sync().await?;
            return Ok(FetchResult {
                success: false,
                changed: false,
            });
        }

        if self.install_path.join(SERVER_BINARY).is_file() {
            error!(
                exit_code = ?exit_code,
                "failed to update server from steam, using existing installation"
            );
            return Ok(FetchResult {
                success: false,
                changed: false,
            });
        }

        error!(
            exit_code = ?exit_code,
            "failed to download server from steam, retrying later; check networking and volume permissions"
        );
        Err(UpdaterError::FetchFailed { exit_code })
    }

    /// Mirror staging onto the live tree. Returns whether anything changed.
    async fn sync(&self) -> Result<bool> {
        tokio::fs::create_dir_all(&self.install_path).await?;

        let mut spec = CommandSpec::new(&self.rsync).args(["-a", "--itemize-changes", "--delete"]);
        for exclude in SYNC_EXCLUDES {
            spec = spec.arg("--exclude").arg(exclude);
        }
        let spec = spec
            .arg(source_dir(&self.download_path))
            .arg(self.install_path.display().to_string())
            .captured();

        let output = self.launcher.run(&spec).await?;
        if !output.success() {
            return Err(UpdaterError::SyncFailed {
                exit_code: output.exit_code,
            });
        }

        let changes = changed_entries(&output.stdout);
        for line in &changes {
            debug!(change = %line, "server file changed");
        }

        if changes.is_empty() {
            info!("server is already the latest version");
        } else {
            info!(changes = changes.len(), "server files were updated");
        }
        Ok(!changes.is_empty())
    }
}

/// rsync source argument: trailing slash copies the contents, not the directory.
fn source_dir(path: &Path) -> String {
    let mut dir = path.display().to_string();
    if !dir.ends_with('/') {
        dir.push('/');
    }
    dir
}

/// Lines of `rsync --itemize-changes` output describing a created, updated
/// or deleted entry.
pub fn changed_entries(output: &str) -> Vec<&str> {
    output
        .lines()
        .filter(|line| matches!(line.chars().next(), Some('>' | 'c' | '*')))
        .collect()
}
