//! Restart check: turns a pending restart intent into a supervisor command.

use std::sync::Arc;

use tracing::{debug, error, info};

use crate::error::Result;
use crate::hooks::{HookPoint, Hooks};
use crate::intent::{IntentQueue, RestartIntent};
use crate::supervisor::{ServerCommand, Supervisor};

/// What the restart check did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartOutcome {
    /// No intent was pending.
    NoIntent,
    /// Start requested but the server was already up.
    AlreadyRunning,
    Started,
    Restarted,
    /// The supervisor rejected the command.
    Failed(ServerCommand),
}

/// Normalize an intent against the current server state.
///
/// `None` means nothing needs to happen.
pub fn resolve(intent: &RestartIntent, running: bool) -> Option<ServerCommand> {
    match intent {
        RestartIntent::Start if running => None,
        RestartIntent::Start => Some(ServerCommand::Start),
        RestartIntent::Restart if !running => Some(ServerCommand::Start),
        RestartIntent::Restart => Some(ServerCommand::Restart),
        RestartIntent::Other(_) => Some(ServerCommand::Restart),
    }
}

pub struct RestartDecision {
    queue: Arc<dyn IntentQueue>,
    supervisor: Arc<dyn Supervisor>,
    hooks: Arc<Hooks>,
}

impl RestartDecision {
    pub fn new(
        queue: Arc<dyn IntentQueue>,
        supervisor: Arc<dyn Supervisor>,
        hooks: Arc<Hooks>,
    ) -> Self {
        Self {
            queue,
            supervisor,
            hooks,
        }
    }

    /// Consume the pending intent, if any, and act on it.
    ///
    /// The intent is gone after this returns, whatever the supervisor said.
    pub async fn check(&self) -> Result<RestartOutcome> {
        let Some(raw) = self.queue.take()? else {
            return Ok(RestartOutcome::NoIntent);
        };

        let intent = RestartIntent::parse(&raw);
        let running = match intent {
            RestartIntent::Other(_) => true,
            _ => self.supervisor.is_running().await,
        };
        debug!(intent = %intent, running, "restart intent found");

        let Some(command) = resolve(&intent, running) else {
            debug!("server is already running, no need to start it");
            return Ok(RestartOutcome::AlreadyRunning);
        };

        let (pre, post) = match command {
            ServerCommand::Start => (HookPoint::PreStart, HookPoint::PostStart),
            ServerCommand::Restart => (HookPoint::PreRestart, HookPoint::PostRestart),
        };

        self.hooks.run(pre).await;
        info!(command = %command, "sending lifecycle command to supervisor");
        let sent = self.supervisor.send(command).await;
        self.hooks.run(post).await;

        Ok(match sent {
            Ok(()) => match command {
                ServerCommand::Start => RestartOutcome::Started,
                ServerCommand::Restart => RestartOutcome::Restarted,
            },
            Err(e) => {
                error!(
                    command = %command,
                    reason = e.reason_code(),
                    error = %e,
                    "supervisor command failed"
                );
                RestartOutcome::Failed(command)
            }
        })
    }
}
