//! Operator hook points.
//!
//! Each hook is a shell line supplied through the environment. The line is
//! looked up again every time its hook point is reached, so an operator can
//! change it without restarting the updater.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::process::Launcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    PreUpdateCheck,
    PostUpdateCheck,
    PreRestart,
    PostRestart,
    PreStart,
    PostStart,
}

impl HookPoint {
    /// Environment variable holding the hook command.
    pub fn env_var(&self) -> &'static str {
        match self {
            HookPoint::PreUpdateCheck => "PRE_UPDATE_CHECK_HOOK",
            HookPoint::PostUpdateCheck => "POST_UPDATE_CHECK_HOOK",
            HookPoint::PreRestart => "PRE_RESTART_HOOK",
            HookPoint::PostRestart => "POST_RESTART_HOOK",
            HookPoint::PreStart => "PRE_START_HOOK",
            HookPoint::PostStart => "POST_START_HOOK",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HookPoint::PreUpdateCheck => "pre_update_check",
            HookPoint::PostUpdateCheck => "post_update_check",
            HookPoint::PreRestart => "pre_restart",
            HookPoint::PostRestart => "post_restart",
            HookPoint::PreStart => "pre_start",
            HookPoint::PostStart => "post_start",
        }
    }
}

/// Where hook commands come from.
pub trait HookSource: Send + Sync {
    fn command(&self, point: HookPoint) -> Option<String>;
}

/// Hooks read from the process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvHookSource;

impl HookSource for EnvHookSource {
    fn command(&self, point: HookPoint) -> Option<String> {
        std::env::var(point.env_var()).ok()
    }
}

/// Fixed hook table.
#[derive(Debug, Default, Clone)]
pub struct StaticHookSource {
    commands: HashMap<HookPoint, String>,
}

impl StaticHookSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, point: HookPoint, command: &str) -> Self {
        self.commands.insert(point, command.to_string());
        self
    }
}

impl HookSource for StaticHookSource {
    fn command(&self, point: HookPoint) -> Option<String> {
        self.commands.get(&point).cloned()
    }
}

pub struct Hooks {
    source: Arc<dyn HookSource>,
    launcher: Arc<dyn Launcher>,
}

impl Hooks {
    pub fn new(source: Arc<dyn HookSource>, launcher: Arc<dyn Launcher>) -> Self {
        Self { source, launcher }
    }

    /// Run the hook for `point` if one is configured.
    ///
    /// Returns the hook's exit code, or `None` when no hook is set.
    pub async fn run(&self, point: HookPoint) -> Option<i32> {
        let command = self
            .source
            .command(point)
            .filter(|command| !command.trim().is_empty());

        let Some(command) = command else {
            debug!(hook = point.name(), "no hook configured");
            return None;
        };

        info!(hook = point.name(), command = %command, "running hook");
        let exit_code = self.launcher.run_shell(&command).await;
        if exit_code != 0 {
            warn!(hook = point.name(), exit_code, "hook exited with failure");
        }
        Some(exit_code)
    }
}
