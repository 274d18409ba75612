//! Single-instance lock.
//!
//! The lock is a pid file created with create-if-absent semantics. A second
//! instance finding the file checks whether the recorded process is alive and
//! backs off; a file naming a dead process is reported for the operator and
//! left in place.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::{debug, warn};

/// A slot that can be claimed by exactly one writer at a time.
pub trait ExclusiveSlot: Send + Sync + fmt::Debug {
    /// Create the slot holding `contents`. Returns `false` if it already exists.
    fn create_exclusive(&self, contents: &str) -> io::Result<bool>;

    /// Read the slot contents, `None` if the slot does not exist.
    fn read(&self) -> io::Result<Option<String>>;

    /// Remove the slot. Removing a missing slot is not an error.
    fn remove(&self) -> io::Result<()>;

    /// Where the slot lives, for logs.
    fn location(&self) -> String;
}

/// Pid file on disk.
#[derive(Debug, Clone)]
pub struct FileSlot {
    path: PathBuf,
}

impl FileSlot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ExclusiveSlot for FileSlot {
    fn create_exclusive(&self, contents: &str) -> io::Result<bool> {
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e),
        };
        writeln!(file, "{}", contents)?;
        file.sync_all()?;
        Ok(true)
    }

    fn read(&self) -> io::Result<Option<String>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn remove(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-memory slot for tests.
#[derive(Debug, Default)]
pub struct MemorySlot {
    value: Mutex<Option<String>>,
}

impl MemorySlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate the slot, as if another process had written it.
    pub fn holding(contents: &str) -> Self {
        Self {
            value: Mutex::new(Some(contents.to_string())),
        }
    }
}

impl ExclusiveSlot for MemorySlot {
    fn create_exclusive(&self, contents: &str) -> io::Result<bool> {
        let mut value = self.value.lock().unwrap_or_else(|e| e.into_inner());
        if value.is_some() {
            return Ok(false);
        }
        *value = Some(contents.to_string());
        Ok(true)
    }

    fn read(&self) -> io::Result<Option<String>> {
        Ok(self.value.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn remove(&self) -> io::Result<()> {
        *self.value.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}

/// Held lock. Releasing (or dropping) it removes the slot.
#[derive(Debug)]
pub struct LockHandle {
    slot: Arc<dyn ExclusiveSlot>,
    pid: u32,
    released: bool,
}

impl LockHandle {
    /// Pid recorded in the lock.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn location(&self) -> String {
        self.slot.location()
    }

    /// Remove the lock.
    pub fn release(mut self) -> io::Result<()> {
        self.released = true;
        debug!(lock = %self.slot.location(), pid = self.pid, "releasing lock");
        self.slot.remove()
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.slot.remove() {
                warn!(lock = %self.slot.location(), error = %e, "failed to remove lock");
            }
        }
    }
}

/// Outcome of a lock attempt.
#[derive(Debug)]
pub enum AcquireOutcome {
    /// This process now owns the lock.
    Acquired(LockHandle),
    /// Another live process owns the lock.
    Busy { owner: u32 },
    /// The lock exists but its owner is gone or unreadable.
    Stale { owner: Option<u32> },
}

/// Try to take the lock for `pid`.
///
/// `is_alive` decides whether a recorded owner is still running; the daemon
/// passes [`process_alive`].
pub fn acquire(
    slot: Arc<dyn ExclusiveSlot>,
    pid: u32,
    is_alive: impl Fn(u32) -> bool,
) -> io::Result<AcquireOutcome> {
    // Second pass covers an owner releasing between our create and read.
    for _ in 0..2 {
        if slot.create_exclusive(&pid.to_string())? {
            debug!(lock = %slot.location(), pid, "lock acquired");
            return Ok(AcquireOutcome::Acquired(LockHandle {
                slot,
                pid,
                released: false,
            }));
        }

        let Some(contents) = slot.read()? else {
            continue;
        };

        return Ok(match contents.trim().parse::<u32>() {
            // A file naming us cannot be ours: we have not written it yet.
            Ok(owner) if owner != pid && is_alive(owner) => AcquireOutcome::Busy { owner },
            Ok(owner) => AcquireOutcome::Stale { owner: Some(owner) },
            Err(_) => AcquireOutcome::Stale { owner: None },
        });
    }

    Ok(AcquireOutcome::Stale { owner: None })
}

/// Check whether a process exists, using a null signal.
pub fn process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        // Exists but owned by someone else
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}
