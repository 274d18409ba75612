//! Update loop.
//!
//! One cycle: preflight, idle gate, fetch, add-on chain, restart intent,
//! restart check. Between cycles the loop waits out the update interval in
//! short ticks so signals are noticed promptly. Signals never interrupt a
//! running external command; they only set flags that the loop polls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::addons::{AddonChain, ChainOutcome};
use crate::config::Config;
use crate::error::Result;
use crate::fetch::{FetchResult, Fetcher};
use crate::hooks::{EnvHookSource, HookPoint, HookSource, Hooks};
use crate::idle::IdleGate;
use crate::intent::{FileIntentQueue, IntentQueue, INTENT_START, INTENT_UPDATED};
use crate::preflight::Preflight;
use crate::process::{Launcher, SystemLauncher};
use crate::restart::{RestartDecision, RestartOutcome};
use crate::supervisor::{CommandIdlePredicate, IdlePredicate, Supervisor, Supervisorctl};

/// Longest uninterrupted sleep while waiting for the next check.
pub const WAIT_TICK: Duration = Duration::from_secs(1);

/// Single-slot flags set asynchronously and polled by the loop.
#[derive(Debug, Default)]
pub struct ControlFlags {
    update_requested: AtomicBool,
    shutting_down: AtomicBool,
    wake: Notify,
}

impl ControlFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cut the current wait short and check for updates.
    pub fn request_update(&self) {
        self.update_requested.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Stop the loop at the next checkpoint.
    pub fn request_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Consume a pending update request.
    pub fn take_update_request(&self) -> bool {
        self.update_requested.swap(false, Ordering::SeqCst)
    }

    /// Sleep for at most `max`, returning early if a flag is raised.
    async fn wait(&self, max: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(max) => {}
            _ = self.wake.notified() => {}
        }
    }
}

/// Route SIGHUP to an update request and SIGINT/SIGTERM to shutdown.
pub fn install_signal_handlers(flags: Arc<ControlFlags>) -> std::io::Result<JoinHandle<()>> {
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sighup.recv() => {
                    info!("received SIGHUP, checking for update now");
                    flags.request_update();
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, shutting down after current step");
                    flags.request_shutdown();
                }
                _ = sigint.recv() => {
                    info!("received SIGINT, shutting down after current step");
                    flags.request_shutdown();
                }
            }
        }
    }))
}

/// State carried from one cycle to the next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonState {
    /// The server has not been started or checked on since startup. Only
    /// governs whether an unchanged update pass writes a `start` intent.
    pub just_started: bool,
    /// Base files changed but the add-on merge has not completed yet.
    pub pending_base_restart: bool,
    /// Cycles started so far.
    pub cycles: u64,
    /// Environment override for SteamCMD from the last preflight.
    pub cpu_override: Option<(String, String)>,
}

impl Default for DaemonState {
    fn default() -> Self {
        Self {
            just_started: true,
            pending_base_restart: false,
            cycles: 0,
            cpu_override: None,
        }
    }
}

/// Record of one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateCycle {
    pub started_at: DateTime<Utc>,
    pub is_first_cycle: bool,
    pub idle_permitted: bool,
    /// `None` when no fetch ran.
    pub fetch_result: Option<FetchResult>,
}

impl UpdateCycle {
    fn begin(is_first_cycle: bool) -> Self {
        Self {
            started_at: Utc::now(),
            is_first_cycle,
            idle_permitted: false,
            fetch_result: None,
        }
    }
}

/// Everything a cycle did, for logs and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub cycle: UpdateCycle,
    pub chain: Option<ChainOutcome>,
    pub intent_written: Option<&'static str>,
    pub restart: Option<RestartOutcome>,
}

/// External collaborators the daemon talks to.
pub struct Dependencies {
    pub launcher: Arc<dyn Launcher>,
    pub supervisor: Arc<dyn Supervisor>,
    pub idle: Arc<dyn IdlePredicate>,
    pub intents: Arc<dyn IntentQueue>,
    pub hooks: Arc<dyn HookSource>,
}

impl Dependencies {
    /// Real processes and files, as deployed.
    pub fn system(config: &Config) -> Self {
        let launcher: Arc<dyn Launcher> = Arc::new(SystemLauncher);
        Self {
            supervisor: Arc::new(Supervisorctl::new(
                Arc::clone(&launcher),
                &config.supervisorctl_path,
                &config.server_service,
            )),
            idle: Arc::new(CommandIdlePredicate::new(
                Arc::clone(&launcher),
                &config.idle_check_command,
            )),
            intents: Arc::new(FileIntentQueue::new(&config.restart_file)),
            hooks: Arc::new(EnvHookSource),
            launcher,
        }
    }
}

pub struct Daemon {
    interval: Duration,
    state: DaemonState,
    flags: Arc<ControlFlags>,
    preflight: Preflight,
    gate: IdleGate,
    fetcher: Fetcher,
    chain: AddonChain,
    intents: Arc<dyn IntentQueue>,
    hooks: Arc<Hooks>,
    restart: RestartDecision,
}

impl Daemon {
    pub fn new(config: &Config, deps: Dependencies, flags: Arc<ControlFlags>) -> Self {
        let hooks = Arc::new(Hooks::new(deps.hooks, Arc::clone(&deps.launcher)));
        Self {
            interval: config.update_interval,
            state: DaemonState::default(),
            flags,
            preflight: Preflight::new(&config.install_path),
            gate: IdleGate::new(
                config.update_if_idle,
                Arc::clone(&deps.supervisor),
                deps.idle,
            ),
            fetcher: Fetcher::new(config, Arc::clone(&deps.launcher)),
            chain: AddonChain::new(config.addons.clone(), deps.launcher),
            intents: Arc::clone(&deps.intents),
            restart: RestartDecision::new(deps.intents, deps.supervisor, Arc::clone(&hooks)),
            hooks,
        }
    }

    /// Replace the resource checks, e.g. to read alternate info files.
    pub fn with_preflight(mut self, preflight: Preflight) -> Self {
        self.preflight = preflight;
        self
    }

    pub fn state(&self) -> &DaemonState {
        &self.state
    }

    /// Run cycles until shutdown is requested.
    pub async fn run(&mut self) {
        info!(
            interval_secs = self.interval.as_secs(),
            "starting update loop"
        );

        while !self.flags.is_shutting_down() {
            match self.run_cycle().await {
                Ok(report) => debug!(
                    cycle = self.state.cycles,
                    idle_permitted = report.cycle.idle_permitted,
                    fetch = ?report.cycle.fetch_result,
                    intent = ?report.intent_written,
                    restart = ?report.restart,
                    "cycle finished"
                ),
                Err(e) => error!(
                    cycle = self.state.cycles,
                    reason = e.reason_code(),
                    command = ?e.command(),
                    exit_code = ?e.exit_code(),
                    error = %e,
                    "update cycle failed, retrying at next check"
                ),
            }
            self.wait_for_next_check().await;
        }

        info!("update loop stopped");
    }

    /// Run a single cycle.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        self.state.cycles += 1;
        let is_first_cycle = self.state.cycles == 1;
        let mut report = CycleReport {
            cycle: UpdateCycle::begin(is_first_cycle),
            chain: None,
            intent_written: None,
            restart: None,
        };

        self.state.cpu_override = self.preflight.run().cpu_override;

        report.cycle.idle_permitted = self.gate.is_idle(is_first_cycle).await;
        if report.cycle.idle_permitted {
            self.update(&mut report).await?;
        } else {
            // Players connected (or unknown): never treat the server as fresh
            self.state.just_started = false;
        }

        report.restart = Some(self.restart.check().await?);
        Ok(report)
    }

    async fn update(&mut self, report: &mut CycleReport) -> Result<()> {
        self.hooks.run(HookPoint::PreUpdateCheck).await;

        let env: Vec<(String, String)> = self.state.cpu_override.iter().cloned().collect();
        let fetched = self.fetcher.fetch(&env).await?;
        report.cycle.fetch_result = Some(fetched);

        let base_changed = fetched.changed || self.state.pending_base_restart;
        let chain = self.chain.run_chain(base_changed).await;
        let chain_ok = chain.success();
        report.chain = Some(chain);

        if base_changed {
            if chain_ok {
                info!("server was updated, scheduling restart");
                self.intents.write(INTENT_UPDATED)?;
                report.intent_written = Some(INTENT_UPDATED);
                self.state.pending_base_restart = false;
            } else {
                warn!("add-on merge did not complete, holding restart until it does");
                self.state.pending_base_restart = true;
            }
        } else if self.state.just_started && chain_ok {
            self.intents.write(INTENT_START)?;
            report.intent_written = Some(INTENT_START);
        }

        if chain_ok {
            self.state.just_started = false;
        }

        self.hooks.run(HookPoint::PostUpdateCheck).await;
        Ok(())
    }

    async fn wait_for_next_check(&self) {
        // `None` only for intervals beyond what the clock can represent
        let deadline = Instant::now().checked_add(self.interval);
        let next_at = chrono::Duration::from_std(self.interval)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d));
        debug!(
            next_check = ?next_at.map(|t| t.to_rfc3339()),
            "waiting for next update check"
        );

        loop {
            if self.flags.is_shutting_down() {
                return;
            }
            if self.flags.take_update_request() {
                info!("update check requested");
                return;
            }
            let tick = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return;
                    }
                    WAIT_TICK.min(deadline - now)
                }
                None => WAIT_TICK,
            };
            self.flags.wait(tick).await;
        }
    }
}
