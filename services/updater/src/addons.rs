//! Add-on chain: re-applies optional add-ons after a base update.
//!
//! Each add-on ships its own updater program. When the base server files
//! change, the add-on's merge marker is created before its updater runs,
//! telling it to merge itself into the fresh base files again. An add-on that
//! is switched off but still installed is kept in step with the base as well.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::process::{CommandSpec, Launcher};

/// Static description of one add-on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddonDescriptor {
    pub name: String,
    pub enabled: bool,
    /// Presence-only file asking the updater to re-merge.
    pub merge_marker_path: PathBuf,
    /// Where the add-on lives once installed.
    pub install_path: PathBuf,
    /// Updater program.
    pub updater: String,
}

impl AddonDescriptor {
    pub fn valheim_plus(enabled: bool) -> Self {
        Self {
            name: "ValheimPlus".to_string(),
            enabled,
            merge_marker_path: PathBuf::from("/opt/valheim/plus.merge"),
            install_path: PathBuf::from("/opt/valheim/plus"),
            updater: "/usr/local/bin/valheim-plus-updater".to_string(),
        }
    }

    pub fn bepinex(enabled: bool) -> Self {
        Self {
            name: "BepInEx".to_string(),
            enabled,
            merge_marker_path: PathBuf::from("/opt/valheim/bepinex.merge"),
            install_path: PathBuf::from("/opt/valheim/bepinex"),
            updater: "/usr/local/bin/bepinex-updater".to_string(),
        }
    }

    /// What the chain does with this add-on.
    pub fn plan(&self, base_changed: bool) -> AddonAction {
        if self.enabled {
            AddonAction::Update
        } else if base_changed && self.install_path.exists() {
            AddonAction::Reapply
        } else {
            AddonAction::Skip
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddonAction {
    /// Enabled: run the updater.
    Update,
    /// Disabled but installed, base changed: re-merge via the updater.
    Reapply,
    /// Disabled and nothing to keep in step.
    Skip,
}

/// Result for one add-on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddonReport {
    pub name: String,
    pub action: AddonAction,
    pub marker_created: bool,
    pub success: bool,
}

/// Result of one pass over the chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainOutcome {
    pub reports: Vec<AddonReport>,
}

impl ChainOutcome {
    /// True when every attempted add-on succeeded.
    pub fn success(&self) -> bool {
        self.reports.iter().all(|r| r.success)
    }

    pub fn attempted(&self) -> impl Iterator<Item = &AddonReport> {
        self.reports.iter().filter(|r| r.action != AddonAction::Skip)
    }
}

pub struct AddonChain {
    addons: Vec<AddonDescriptor>,
    launcher: Arc<dyn Launcher>,
}

impl AddonChain {
    pub fn new(addons: Vec<AddonDescriptor>, launcher: Arc<dyn Launcher>) -> Self {
        Self { addons, launcher }
    }

    /// Run every add-on in order. A failing add-on does not stop the rest.
    pub async fn run_chain(&self, base_changed: bool) -> ChainOutcome {
        let mut outcome = ChainOutcome::default();
        for addon in &self.addons {
            outcome.reports.push(self.run_one(addon, base_changed).await);
        }
        outcome
    }

    async fn run_one(&self, addon: &AddonDescriptor, base_changed: bool) -> AddonReport {
        let action = addon.plan(base_changed);
        let mut report = AddonReport {
            name: addon.name.clone(),
            action,
            marker_created: false,
            success: true,
        };

        if action == AddonAction::Skip {
            debug!(addon = %addon.name, "add-on disabled and not installed, skipping");
            return report;
        }

        if base_changed {
            if let Err(e) = tokio::fs::write(&addon.merge_marker_path, b"").await {
                error!(
                    addon = %addon.name,
                    marker = %addon.merge_marker_path.display(),
                    error = %e,
                    "failed to create merge marker"
                );
                report.success = false;
                return report;
            }
            report.marker_created = true;
            debug!(addon = %addon.name, marker = %addon.merge_marker_path.display(), "merge marker created");
        }

        match action {
            AddonAction::Update => info!(addon = %addon.name, "updating add-on"),
            _ => info!(addon = %addon.name, "add-on disabled but installed, re-merging with new server files"),
        }

        let spec = CommandSpec::new(&addon.updater);
        report.success = match self.launcher.run(&spec).await {
            Ok(output) if output.success() => true,
            Ok(output) => {
                error!(addon = %addon.name, exit_code = ?output.exit_code, "add-on updater failed");
                false
            }
            Err(e) => {
                error!(addon = %addon.name, error = %e, "failed to launch add-on updater");
                false
            }
        };
        report
    }
}
