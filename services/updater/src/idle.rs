//! Idle gate: decides whether an update attempt may run this cycle.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::supervisor::{IdlePredicate, Supervisor};

pub struct IdleGate {
    /// Only update while no players are connected.
    enabled: bool,
    supervisor: Arc<dyn Supervisor>,
    predicate: Arc<dyn IdlePredicate>,
}

impl IdleGate {
    pub fn new(
        enabled: bool,
        supervisor: Arc<dyn Supervisor>,
        predicate: Arc<dyn IdlePredicate>,
    ) -> Self {
        Self {
            enabled,
            supervisor,
            predicate,
        }
    }

    /// Whether an update may proceed. `first_cycle` is true only for the
    /// first cycle since the daemon started.
    pub async fn is_idle(&self, first_cycle: bool) -> bool {
        if !self.enabled {
            return true;
        }

        if first_cycle && !self.supervisor.is_running().await {
            debug!("updater was just started and server is not running, skipping player check");
            return true;
        }

        match self.predicate.is_idle().await {
            Ok(true) => {
                debug!("no players connected to server");
                true
            }
            Ok(false) => {
                debug!("players connected to server, skipping update check");
                false
            }
            Err(e) => {
                warn!(error = %e, "idle check failed, assuming players are connected");
                false
            }
        }
    }
}
