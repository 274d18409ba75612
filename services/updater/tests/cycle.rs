//! Integration tests for full update cycles.
//!
//! These tests drive the daemon end to end with mocks standing in for
//! SteamCMD, rsync, supervisord, the idle check and the add-on updaters.
//! Filesystem effects (merge markers, install directories) use a temp dir.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::{tempdir, TempDir};
use valheim_updater::addons::AddonDescriptor;
use valheim_updater::daemon::{ControlFlags, Daemon, Dependencies};
use valheim_updater::hooks::{HookPoint, StaticHookSource};
use valheim_updater::intent::{IntentQueue, MemoryIntentQueue};
use valheim_updater::preflight::Preflight;
use valheim_updater::process::{CommandOutput, MockLauncher};
use valheim_updater::restart::RestartOutcome;
use valheim_updater::supervisor::{MockServer, ServerCommand};
use valheim_updater::Config;

const RSYNC_UPDATED: &str = ">f.st...... valheim_server.x86_64\n>f+++++++++ valheim_server_Data/Managed/assembly_valheim.dll\n";
const RSYNC_UNCHANGED: &str = ".d..t...... ./\n";

struct Harness {
    dir: TempDir,
    config: Config,
    launcher: Arc<MockLauncher>,
    server: Arc<MockServer>,
    intents: Arc<MemoryIntentQueue>,
    flags: Arc<ControlFlags>,
}

impl Harness {
    fn new(valheim_plus: bool, bepinex: bool) -> Self {
        let dir = tempdir().unwrap();
        let root = dir.path();

        let mut config = Config::from_lookup(|_| None).unwrap();
        config.update_interval = Duration::from_millis(20);
        config.download_path = root.join("dl/server");
        config.install_path = root.join("server");
        config.steamcmd_path = "steamcmd".to_string();
        config.addons = vec![
            addon(root, "ValheimPlus", valheim_plus, "valheim-plus-updater"),
            addon(root, "BepInEx", bepinex, "bepinex-updater"),
        ];

        fs::write(root.join("cpuinfo"), "processor\t: 0\ncpu MHz\t\t: 2400.000\n").unwrap();
        fs::write(root.join("meminfo"), "MemTotal:       16384000 kB\n").unwrap();

        Self {
            dir,
            config,
            launcher: Arc::new(MockLauncher::new()),
            server: Arc::new(MockServer::new()),
            intents: Arc::new(MemoryIntentQueue::new()),
            flags: Arc::new(ControlFlags::new()),
        }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn daemon(&self) -> Daemon {
        let hooks = StaticHookSource::new()
            .with(HookPoint::PreUpdateCheck, "pre-update-check")
            .with(HookPoint::PostUpdateCheck, "post-update-check");

        let deps = Dependencies {
            launcher: self.launcher.clone(),
            supervisor: self.server.clone(),
            idle: self.server.clone(),
            intents: self.intents.clone(),
            hooks: Arc::new(hooks),
        };

        Daemon::new(&self.config, deps, self.flags.clone()).with_preflight(Preflight::with_sources(
            self.root().join("cpuinfo"),
            self.root().join("meminfo"),
            self.root(),
        ))
    }

    fn rsync_reports(&self, output: &str) {
        self.launcher
            .respond("rsync", CommandOutput::with_stdout(0, output));
    }

    fn place_live_binary(&self) {
        fs::create_dir_all(&self.config.install_path).unwrap();
        fs::write(self.config.install_path.join("valheim_server.x86_64"), b"elf").unwrap();
    }
}

fn addon(root: &Path, name: &str, enabled: bool, updater: &str) -> AddonDescriptor {
    AddonDescriptor {
        name: name.to_string(),
        enabled,
        merge_marker_path: root.join(format!("{}.merge", name)),
        install_path: root.join(name),
        updater: updater.to_string(),
    }
}

#[tokio::test]
async fn test_base_update_with_valheim_plus_enabled() {
    let h = Harness::new(true, false);
    h.server.set_running(true);
    h.rsync_reports(RSYNC_UPDATED);

    let mut daemon = h.daemon();
    let report = daemon.run_cycle().await.unwrap();

    let fetched = report.cycle.fetch_result.unwrap();
    assert!(fetched.success);
    assert!(fetched.changed);

    // Marker only for ValheimPlus; BepInEx never touched
    assert!(h.config.addons[0].merge_marker_path.exists());
    assert!(!h.config.addons[1].merge_marker_path.exists());
    assert_eq!(h.launcher.calls_to("valheim-plus-updater").len(), 1);
    assert!(h.launcher.calls_to("bepinex-updater").is_empty());

    assert_eq!(report.intent_written, Some("updated"));
    assert_eq!(h.intents.history(), vec!["updated".to_string()]);

    // The same cycle consumed the intent and restarted the server
    assert_eq!(report.restart, Some(RestartOutcome::Restarted));
    assert_eq!(h.server.commands(), vec![ServerCommand::Restart]);
    assert_eq!(h.intents.peek(), None);
    assert!(!daemon.state().just_started);

    assert_eq!(
        h.launcher.shell_lines(),
        vec!["pre-update-check", "post-update-check"]
    );
}

#[tokio::test]
async fn test_players_connected_skips_update() {
    let h = Harness::new(true, false);
    let mut daemon = h.daemon();

    // First cycle settles the just-started state
    h.rsync_reports(RSYNC_UNCHANGED);
    daemon.run_cycle().await.unwrap();
    assert!(!daemon.state().just_started);

    h.server.set_running(true);
    h.server.set_players_connected(true);
    let steam_calls = h.launcher.calls_to("steamcmd").len();
    let writes = h.intents.history().len();

    let report = daemon.run_cycle().await.unwrap();
    assert!(!report.cycle.idle_permitted);
    assert!(!report.cycle.is_first_cycle);
    assert_eq!(report.cycle.fetch_result, None);
    assert_eq!(report.intent_written, None);
    assert_eq!(report.restart, Some(RestartOutcome::NoIntent));
    assert_eq!(h.launcher.calls_to("steamcmd").len(), steam_calls);
    assert_eq!(h.intents.history().len(), writes);
}

#[tokio::test]
async fn test_server_stopped_after_busy_first_cycle_stays_stopped() {
    let h = Harness::new(false, false);
    h.server.set_running(true);
    h.server.set_players_connected(true);

    let mut daemon = h.daemon();
    let report = daemon.run_cycle().await.unwrap();
    assert!(report.cycle.is_first_cycle);
    assert!(!report.cycle.idle_permitted);

    // Operator stops the server and everyone leaves
    h.server.set_running(false);
    h.server.set_players_connected(false);
    h.rsync_reports(RSYNC_UNCHANGED);

    let report = daemon.run_cycle().await.unwrap();
    assert!(!report.cycle.is_first_cycle);
    assert!(report.cycle.idle_permitted);
    assert_eq!(h.server.idle_checks(), 2);
    assert_eq!(report.intent_written, None);
    assert_eq!(report.restart, Some(RestartOutcome::NoIntent));
    assert!(h.server.commands().is_empty());
}

#[tokio::test]
async fn test_first_cycle_without_changes_starts_server() {
    let h = Harness::new(false, false);
    h.server.set_players_connected(true);
    h.rsync_reports(RSYNC_UNCHANGED);

    let mut daemon = h.daemon();
    let report = daemon.run_cycle().await.unwrap();

    assert!(report.cycle.is_first_cycle);
    assert!(report.cycle.idle_permitted);
    assert_eq!(report.intent_written, Some("start"));
    assert_eq!(report.restart, Some(RestartOutcome::Started));
    assert_eq!(h.server.commands(), vec![ServerCommand::Start]);
}

#[tokio::test]
async fn test_hard_fetch_failure_ends_cycle_early() {
    let h = Harness::new(true, false);
    h.launcher.respond("steamcmd", CommandOutput::exited(8));
    // Pending intent from an earlier writer must survive the aborted cycle
    h.intents.write("restart").unwrap();

    let mut daemon = h.daemon();
    let err = daemon.run_cycle().await.unwrap_err();

    assert!(err.is_fatal_to_cycle());
    assert!(h.launcher.calls_to("valheim-plus-updater").is_empty());
    assert!(h.launcher.calls_to("rsync").is_empty());
    assert!(h.server.commands().is_empty());
    assert_eq!(h.intents.peek().as_deref(), Some("restart"));
    assert!(daemon.state().just_started);
}

#[tokio::test]
async fn test_soft_fetch_failure_continues_cycle() {
    let h = Harness::new(false, false);
    h.place_live_binary();
    h.server.set_running(true);
    h.launcher.respond("steamcmd", CommandOutput::exited(8));

    let mut daemon = h.daemon();
    let report = daemon.run_cycle().await.unwrap();

    let fetched = report.cycle.fetch_result.unwrap();
    assert!(!fetched.success);
    assert!(!fetched.changed);
    // Just started and nothing changed: start intent, server already up
    assert_eq!(report.intent_written, Some("start"));
    assert_eq!(report.restart, Some(RestartOutcome::AlreadyRunning));
    assert!(h.server.commands().is_empty());
}

#[tokio::test]
async fn test_failed_merge_holds_restart_until_next_cycle() {
    let h = Harness::new(true, false);
    h.server.set_running(true);
    h.rsync_reports(RSYNC_UPDATED);
    h.launcher
        .respond("valheim-plus-updater", CommandOutput::exited(1));

    let mut daemon = h.daemon();
    let report = daemon.run_cycle().await.unwrap();
    assert!(!report.chain.as_ref().unwrap().success());
    assert_eq!(report.intent_written, None);
    assert_eq!(report.restart, Some(RestartOutcome::NoIntent));
    assert!(daemon.state().pending_base_restart);

    // Base already mirrored; merge succeeds this time
    h.rsync_reports(RSYNC_UNCHANGED);
    fs::remove_file(&h.config.addons[0].merge_marker_path).unwrap();
    let report = daemon.run_cycle().await.unwrap();

    assert!(h.config.addons[0].merge_marker_path.exists());
    assert_eq!(report.intent_written, Some("updated"));
    assert_eq!(report.restart, Some(RestartOutcome::Restarted));
    assert!(!daemon.state().pending_base_restart);
}

#[tokio::test]
async fn test_disabled_but_installed_addon_follows_base() {
    let h = Harness::new(true, false);
    fs::create_dir_all(&h.config.addons[1].install_path).unwrap();
    h.rsync_reports(RSYNC_UPDATED);
    h.launcher
        .respond("valheim-plus-updater", CommandOutput::exited(1));

    let mut daemon = h.daemon();
    let report = daemon.run_cycle().await.unwrap();

    let chain = report.chain.unwrap();
    assert_eq!(chain.attempted().count(), 2);
    assert!(h.config.addons[1].merge_marker_path.exists());
    assert_eq!(h.launcher.calls_to("bepinex-updater").len(), 1);
}

#[tokio::test]
async fn test_cpu_fallback_passed_to_steamcmd() {
    let h = Harness::new(false, false);
    fs::write(h.root().join("cpuinfo"), "processor\t: 0\n").unwrap();
    h.rsync_reports(RSYNC_UNCHANGED);

    let mut daemon = h.daemon();
    daemon.run_cycle().await.unwrap();
    let steam = &h.launcher.calls_to("steamcmd")[0];
    assert_eq!(steam.env, vec![("CPU_MHZ".to_string(), "2000".to_string())]);

    // Clock detectable again: no stale override
    fs::write(h.root().join("cpuinfo"), "cpu MHz\t\t: 2400.000\n").unwrap();
    h.rsync_reports(RSYNC_UNCHANGED);
    daemon.run_cycle().await.unwrap();
    let steam = &h.launcher.calls_to("steamcmd")[1];
    assert!(steam.env.is_empty());
    assert_eq!(daemon.state().cpu_override, None);
}

#[tokio::test]
async fn test_loop_stops_on_shutdown() {
    let h = Harness::new(false, false);
    let flags = h.flags.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        flags.request_shutdown();
    });

    let mut daemon = h.daemon();
    tokio::time::timeout(Duration::from_secs(10), daemon.run())
        .await
        .expect("loop should stop after shutdown request");

    assert!(daemon.state().cycles >= 1);
}

#[tokio::test]
async fn test_shutdown_before_start_runs_no_cycle() {
    let h = Harness::new(false, false);
    h.flags.request_shutdown();

    let mut daemon = h.daemon();
    daemon.run().await;

    assert_eq!(daemon.state().cycles, 0);
    assert!(h.launcher.calls().is_empty());
}

#[tokio::test]
async fn test_update_request_cuts_wait_short() {
    let mut h = Harness::new(false, false);
    h.config.update_interval = Duration::from_secs(3600);

    let flags = h.flags.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        flags.request_update();
        tokio::time::sleep(Duration::from_millis(100)).await;
        flags.request_shutdown();
    });

    let mut daemon = h.daemon();
    tokio::time::timeout(Duration::from_secs(10), daemon.run())
        .await
        .expect("loop should stop after shutdown request");

    // Initial cycle plus the one requested via the flag
    assert_eq!(daemon.state().cycles, 2);
}

#[tokio::test]
async fn test_unrepresentable_interval_keeps_loop_alive() {
    let mut h = Harness::new(false, false);
    h.config.update_interval = Duration::MAX;

    let flags = h.flags.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        flags.request_update();
        tokio::time::sleep(Duration::from_millis(100)).await;
        flags.request_shutdown();
    });

    let mut daemon = h.daemon();
    tokio::time::timeout(Duration::from_secs(10), daemon.run())
        .await
        .expect("loop should stop after shutdown request");

    assert_eq!(daemon.state().cycles, 2);
}
