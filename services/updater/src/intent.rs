//! Restart intent: a single-slot persisted message.
//!
//! The updater and the add-on updaters record what the supervisor should do
//! next by writing the intent file. The restart check takes it exactly once
//! per cycle. Writers do not coordinate, so the last write before a take wins.

use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Intent asking for a start if the server is down.
pub const INTENT_START: &str = "start";

/// Intent asking for a restart.
pub const INTENT_RESTART: &str = "restart";

/// Intent written after the base server files changed.
pub const INTENT_UPDATED: &str = "updated";

/// Parsed intent content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartIntent {
    Start,
    Restart,
    /// Anything else, including an empty file.
    Other(String),
}

impl RestartIntent {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            INTENT_START => RestartIntent::Start,
            INTENT_RESTART => RestartIntent::Restart,
            other => RestartIntent::Other(other.to_string()),
        }
    }
}

impl fmt::Display for RestartIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartIntent::Start => f.write_str(INTENT_START),
            RestartIntent::Restart => f.write_str(INTENT_RESTART),
            RestartIntent::Other(raw) => write!(f, "{:?}", raw),
        }
    }
}

/// Single-slot message queue.
pub trait IntentQueue: Send + Sync + fmt::Debug {
    /// Replace the slot contents.
    fn write(&self, intent: &str) -> io::Result<()>;

    /// Remove and return the slot contents.
    fn take(&self) -> io::Result<Option<String>>;
}

/// Intent file shared with the add-on updaters.
#[derive(Debug, Clone)]
pub struct FileIntentQueue {
    path: PathBuf,
}

impl FileIntentQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name: OsString = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(suffix);
        self.path.with_file_name(name)
    }
}

impl IntentQueue for FileIntentQueue {
    fn write(&self, intent: &str) -> io::Result<()> {
        let tmp = self.sibling(&format!(".tmp.{}", std::process::id()));
        fs::write(&tmp, format!("{}\n", intent))?;
        fs::rename(&tmp, &self.path)
    }

    fn take(&self) -> io::Result<Option<String>> {
        // Claim the file first so a write landing after this point survives
        // for the next cycle instead of being deleted unread.
        let claimed = self.sibling(&format!(".taken.{}", std::process::id()));
        match fs::rename(&self.path, &claimed) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        }

        let contents = fs::read(&claimed);
        let removed = fs::remove_file(&claimed);
        let contents = contents?;
        removed?;

        Ok(Some(String::from_utf8_lossy(&contents).into_owned()))
    }
}

/// In-memory queue for tests. Keeps a history of writes.
#[derive(Debug, Default)]
pub struct MemoryIntentQueue {
    slot: Mutex<Option<String>>,
    history: Mutex<Vec<String>>,
}

impl MemoryIntentQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current slot contents without consuming them.
    pub fn peek(&self) -> Option<String> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Every value written so far.
    pub fn history(&self) -> Vec<String> {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl IntentQueue for MemoryIntentQueue {
    fn write(&self, intent: &str) -> io::Result<()> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(intent.to_string());
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(intent.to_string());
        Ok(())
    }

    fn take(&self) -> io::Result<Option<String>> {
        Ok(self.slot.lock().unwrap_or_else(|e| e.into_inner()).take())
    }
}
