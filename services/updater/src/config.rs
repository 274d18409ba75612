//! Configuration for the updater.
//!
//! Everything is read from environment variables set on the container, with
//! defaults matching the stock image layout.

use std::path::PathBuf;
use std::time::Duration;

use crate::addons::AddonDescriptor;
use crate::error::{Result, UpdaterError};

/// Default seconds between update checks.
const DEFAULT_UPDATE_INTERVAL_SECS: u64 = 900;
/// One year.
const MAX_UPDATE_INTERVAL_SECS: u64 = 365 * 24 * 60 * 60;

/// Updater configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Time between update checks.
    pub update_interval: Duration,

    /// Only update while no players are connected.
    pub update_if_idle: bool,

    /// Extra arguments appended to `+app_update`.
    pub steamcmd_args: Vec<String>,

    /// SteamCMD staging directory.
    pub download_path: PathBuf,

    /// Live server directory.
    pub install_path: PathBuf,

    /// Single-instance lock file.
    pub pid_file: PathBuf,

    /// Restart intent file shared with the add-on updaters.
    pub restart_file: PathBuf,

    /// SteamCMD entry point.
    pub steamcmd_path: String,

    /// rsync binary.
    pub rsync_path: String,

    /// supervisorctl binary.
    pub supervisorctl_path: String,

    /// Supervisor program name of the game server.
    pub server_service: String,

    /// Command exiting 0 when no players are connected.
    pub idle_check_command: String,

    /// Optional JSON log file.
    pub log_file: Option<PathBuf>,

    /// Add-ons, in the order their updaters run.
    pub addons: Vec<AddonDescriptor>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_string());
        let flag = |name: &str, default: bool| match lookup(name) {
            Some(value) => parse_bool(name, &value),
            None => Ok(default),
        };

        let update_interval = match lookup("UPDATE_INTERVAL") {
            Some(value) => parse_interval("UPDATE_INTERVAL", &value)?,
            None => DEFAULT_UPDATE_INTERVAL_SECS,
        };

        let steamcmd_args = var("STEAMCMD_ARGS", "validate")
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let log_file = lookup("UPDATER_LOG_FILE")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let addons = vec![
            AddonDescriptor::valheim_plus(flag("VALHEIM_PLUS", false)?),
            AddonDescriptor::bepinex(flag("BEPINEX", false)?),
        ];

        Ok(Self {
            update_interval: Duration::from_secs(update_interval),
            update_if_idle: flag("UPDATE_IF_IDLE", true)?,
            steamcmd_args,
            download_path: var("VALHEIM_DOWNLOAD_PATH", "/opt/valheim/dl/server").into(),
            install_path: var("VALHEIM_INSTALL_PATH", "/opt/valheim/server").into(),
            pid_file: var("UPDATER_PID_FILE", "/var/run/valheim-updater.pid").into(),
            restart_file: var("VALHEIM_RESTART_FILE", "/tmp/valheim.restart").into(),
            steamcmd_path: var("STEAMCMD_PATH", "/opt/steamcmd/steamcmd.sh"),
            rsync_path: var("RSYNC_PATH", "rsync"),
            supervisorctl_path: var("SUPERVISORCTL_PATH", "supervisorctl"),
            server_service: var("SERVER_SERVICE_NAME", "valheim-server"),
            idle_check_command: var("IDLE_CHECK_COMMAND", "/usr/local/bin/valheim-is-idle"),
            log_file,
            addons,
        })
    }
}

/// Seconds between checks; must be within `1..=MAX_UPDATE_INTERVAL_SECS`.
fn parse_interval(name: &str, value: &str) -> Result<u64> {
    match value.trim().parse::<u64>() {
        Ok(secs) if (1..=MAX_UPDATE_INTERVAL_SECS).contains(&secs) => Ok(secs),
        _ => Err(UpdaterError::ConfigInvalid {
            name: name.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(UpdaterError::ConfigInvalid {
            name: name.to_string(),
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.update_interval, Duration::from_secs(900));
        assert!(config.update_if_idle);
        assert_eq!(config.steamcmd_args, vec!["validate"]);
        assert_eq!(config.install_path, PathBuf::from("/opt/valheim/server"));
        assert_eq!(config.server_service, "valheim-server");
        assert!(config.log_file.is_none());

        let names: Vec<_> = config.addons.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["ValheimPlus", "BepInEx"]);
        assert!(config.addons.iter().all(|a| !a.enabled));
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("UPDATE_INTERVAL", "60"),
            ("UPDATE_IF_IDLE", "false"),
            ("STEAMCMD_ARGS", "-beta public-test -betapassword yesimadebackups"),
            ("VALHEIM_PLUS", "true"),
            ("UPDATER_LOG_FILE", "/config/updater.log"),
        ])
        .unwrap();

        assert_eq!(config.update_interval, Duration::from_secs(60));
        assert!(!config.update_if_idle);
        assert_eq!(config.steamcmd_args.len(), 4);
        assert!(config.addons[0].enabled);
        assert!(!config.addons[1].enabled);
        assert_eq!(config.log_file, Some(PathBuf::from("/config/updater.log")));
    }

    #[test]
    fn test_invalid_values() {
        let err = load(&[("UPDATE_INTERVAL", "soon")]).unwrap_err();
        assert_eq!(err.reason_code(), "config_invalid");

        let err = load(&[("BEPINEX", "maybe")]).unwrap_err();
        assert!(err.to_string().contains("BEPINEX=maybe"));
    }

    #[test]
    fn test_update_interval_bounds() {
        for value in ["0", "18446744073709551615", "31536001", "-5"] {
            let err = load(&[("UPDATE_INTERVAL", value)]).unwrap_err();
            assert_eq!(err.reason_code(), "config_invalid", "value {}", value);
        }

        let config = load(&[("UPDATE_INTERVAL", "31536000")]).unwrap();
        assert_eq!(config.update_interval, Duration::from_secs(31_536_000));
        let config = load(&[("UPDATE_INTERVAL", " 1 ")]).unwrap();
        assert_eq!(config.update_interval, Duration::from_secs(1));
    }
}
