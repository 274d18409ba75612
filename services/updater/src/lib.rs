//! Valheim server updater library.
//!
//! Keeps a dedicated Valheim server current: checks Steam for new builds on an
//! interval, installs them only while no players are connected, re-applies
//! add-ons (ValheimPlus, BepInEx) on top of fresh server files, and asks
//! supervisord to start or restart the server.
//!
//! ## Architecture
//!
//! ```text
//! Daemon (update loop, signal flags)
//! ├── Preflight          (cpu clock, memory, storage checks)
//! ├── IdleGate           (player check via IdlePredicate)
//! ├── Fetcher            (steamcmd download + rsync mirror)
//! ├── AddonChain         (merge markers + add-on updaters)
//! └── RestartDecision    (restart intent -> Supervisor command, hooks)
//! ```
//!
//! Cross-process state lives in two files: the pid lock (`lock`) and the
//! restart intent (`intent`). Every external program is run through
//! `process::Launcher`, so tests drive the whole loop with mocks.

pub mod addons;
pub mod config;
pub mod daemon;
pub mod error;
pub mod fetch;
pub mod hooks;
pub mod idle;
pub mod intent;
pub mod lock;
pub mod logging;
pub mod preflight;
pub mod process;
pub mod restart;
pub mod supervisor;

// Re-export commonly used types
pub use config::Config;
pub use daemon::{ControlFlags, CycleReport, Daemon, Dependencies};
pub use error::UpdaterError;
