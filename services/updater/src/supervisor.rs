//! Clients for the process supervisor and the idle check.
//!
//! The updater never manages the server process itself. It asks supervisord
//! (through `supervisorctl`) whether the server runs and tells it to start or
//! restart, and it asks an external helper whether any players are connected.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{Result, UpdaterError};
use crate::process::{CommandSpec, Launcher};

/// Lifecycle command sent to the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerCommand {
    Start,
    Restart,
}

impl ServerCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerCommand::Start => "start",
            ServerCommand::Restart => "restart",
        }
    }
}

impl fmt::Display for ServerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process supervisor interface.
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Whether the server process is currently running.
    async fn is_running(&self) -> bool;

    /// Ask the supervisor to start or restart the server.
    async fn send(&self, command: ServerCommand) -> Result<()>;
}

/// Zero-players predicate.
#[async_trait]
pub trait IdlePredicate: Send + Sync {
    /// `Ok(true)` when no players are connected.
    async fn is_idle(&self) -> Result<bool>;
}

/// `supervisorctl` client for one named program.
pub struct Supervisorctl {
    launcher: Arc<dyn Launcher>,
    program: String,
    service: String,
}

impl Supervisorctl {
    pub fn new(launcher: Arc<dyn Launcher>, program: &str, service: &str) -> Self {
        Self {
            launcher,
            program: program.to_string(),
            service: service.to_string(),
        }
    }
}

#[async_trait]
impl Supervisor for Supervisorctl {
    async fn is_running(&self) -> bool {
        let spec = CommandSpec::new(&self.program)
            .args(["status", self.service.as_str()])
            .captured();

        // supervisorctl exits non-zero for stopped programs, so only the
        // status text is meaningful.
        match self.launcher.run(&spec).await {
            Ok(output) => {
                let running = output.stdout.contains("RUNNING");
                debug!(service = %self.service, running, "server status");
                running
            }
            Err(e) => {
                warn!(service = %self.service, error = %e, "failed to query server status");
                false
            }
        }
    }

    async fn send(&self, command: ServerCommand) -> Result<()> {
        let spec = CommandSpec::new(&self.program).args([command.as_str(), self.service.as_str()]);
        let output = self.launcher.run(&spec).await?;
        if !output.success() {
            return Err(UpdaterError::CommandFailed {
                command: spec.display(),
                exit_code: output.exit_code,
            });
        }
        Ok(())
    }
}

/// Idle check delegated to an external command; exit 0 means idle.
pub struct CommandIdlePredicate {
    launcher: Arc<dyn Launcher>,
    command: String,
}

impl CommandIdlePredicate {
    pub fn new(launcher: Arc<dyn Launcher>, command: &str) -> Self {
        Self {
            launcher,
            command: command.to_string(),
        }
    }
}

#[async_trait]
impl IdlePredicate for CommandIdlePredicate {
    async fn is_idle(&self) -> Result<bool> {
        let output = self.launcher.run(&CommandSpec::new(&self.command)).await?;
        Ok(output.success())
    }
}

/// Mock server for tests: answers both the supervisor and the idle check.
#[derive(Debug, Default)]
pub struct MockServer {
    running: AtomicBool,
    players_connected: AtomicBool,
    idle_check_fails: AtomicBool,
    command_fails: AtomicBool,
    idle_checks: AtomicUsize,
    commands: Mutex<Vec<ServerCommand>>,
}

impl MockServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn set_players_connected(&self, connected: bool) {
        self.players_connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_idle_check_fails(&self, fails: bool) {
        self.idle_check_fails.store(fails, Ordering::SeqCst);
    }

    pub fn set_command_fails(&self, fails: bool) {
        self.command_fails.store(fails, Ordering::SeqCst);
    }

    /// Number of times the idle predicate was consulted.
    pub fn idle_checks(&self) -> usize {
        self.idle_checks.load(Ordering::SeqCst)
    }

    /// Commands received, in order.
    pub fn commands(&self) -> Vec<ServerCommand> {
        self.commands.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Supervisor for MockServer {
    async fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn send(&self, command: ServerCommand) -> Result<()> {
        self.commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(command);
        if self.command_fails.load(Ordering::SeqCst) {
            return Err(UpdaterError::CommandFailed {
                command: format!("supervisorctl {} valheim-server", command),
                exit_code: Some(7),
            });
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl IdlePredicate for MockServer {
    async fn is_idle(&self) -> Result<bool> {
        self.idle_checks.fetch_add(1, Ordering::SeqCst);
        if self.idle_check_fails.load(Ordering::SeqCst) {
            return Err(UpdaterError::CommandSpawn {
                command: "valheim-is-idle".to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }
        Ok(!self.players_connected.load(Ordering::SeqCst))
    }
}
