//! External command execution.
//!
//! Every collaborator the updater talks to (SteamCMD, rsync, supervisorctl,
//! add-on updaters, hooks, the idle check) is an external program. They are
//! all run through the [`Launcher`] trait so the decision logic can be driven
//! by a scripted fake in tests.

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Result, UpdaterError};

/// Exit code reported for a process terminated by a signal.
const SIGNALED_EXIT_CODE: i32 = 128;

/// Exit code reported when a shell line could not be launched at all.
const LAUNCH_FAILED_EXIT_CODE: i32 = 127;

/// A command to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program path or name resolved via `PATH`.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Extra environment on top of the ambient one.
    pub env: Vec<(String, String)>,
    /// Capture stdout instead of passing it through.
    pub capture: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            capture: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn captured(mut self) -> Self {
        self.capture = true;
        self
    }

    /// Human-readable command line for logs and errors.
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if the process was killed by a signal.
    pub exit_code: Option<i32>,
    /// Captured stdout (empty unless the spec asked for capture).
    pub stdout: String,
}

impl CommandOutput {
    pub fn exited(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            stdout: String::new(),
        }
    }

    pub fn with_stdout(code: i32, stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(code),
            stdout: stdout.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs external commands to completion.
///
/// Calls block until the child exits; no timeout is imposed.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Run a command and wait for it.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Run an operator-supplied line through `sh -c` and return its exit code.
    ///
    /// Never fails: launch errors are logged and mapped to 127.
    async fn run_shell(&self, line: &str) -> i32 {
        let spec = CommandSpec::new("sh").arg("-c").arg(line);
        match self.run(&spec).await {
            Ok(output) => output.exit_code.unwrap_or(SIGNALED_EXIT_CODE),
            Err(e) => {
                warn!(error = %e, command = %line, "failed to launch shell command");
                LAUNCH_FAILED_EXIT_CODE
            }
        }
    }
}

/// Launcher backed by real child processes.
#[derive(Debug, Default, Clone)]
pub struct SystemLauncher;

#[async_trait]
impl Launcher for SystemLauncher {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        debug!(command = %spec.display(), "running command");

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .stdout(if spec.capture {
                Stdio::piped()
            } else {
                Stdio::inherit()
            });

        let output = cmd.output().await.map_err(|e| UpdaterError::CommandSpawn {
            command: spec.display(),
            source: e,
        })?;

        let exit_code = output.status.code();
        debug!(command = %spec.program, exit_code = ?exit_code, "command finished");

        Ok(CommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        })
    }
}

/// Mock launcher for tests.
///
/// Records every command and answers from per-program queues of scripted
/// outputs. Programs without a scripted answer exit 0 with no output.
#[derive(Debug, Default)]
pub struct MockLauncher {
    calls: Mutex<Vec<CommandSpec>>,
    scripted: Mutex<HashMap<String, VecDeque<Result<CommandOutput>>>>,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an output for the next run of `program`.
    pub fn respond(&self, program: &str, output: CommandOutput) -> &Self {
        self.push(program, Ok(output));
        self
    }

    /// Queue a spawn failure for the next run of `program`.
    pub fn fail_spawn(&self, program: &str) -> &Self {
        self.push(
            program,
            Err(UpdaterError::CommandSpawn {
                command: program.to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            }),
        );
        self
    }

    fn push(&self, program: &str, answer: Result<CommandOutput>) {
        self.scripted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(program.to_string())
            .or_default()
            .push_back(answer);
    }

    /// All commands run so far, in order.
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Commands run so far for one program.
    pub fn calls_to(&self, program: &str) -> Vec<CommandSpec> {
        self.calls()
            .into_iter()
            .filter(|spec| spec.program == program)
            .collect()
    }

    /// Shell lines passed to `sh -c`.
    pub fn shell_lines(&self) -> Vec<String> {
        self.calls_to("sh")
            .into_iter()
            .filter_map(|spec| spec.args.get(1).cloned())
            .collect()
    }
}

#[async_trait]
impl Launcher for MockLauncher {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(spec.clone());

        let answer = self
            .scripted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&spec.program)
            .and_then(VecDeque::pop_front);

        answer.unwrap_or_else(|| Ok(CommandOutput::exited(0)))
    }
}
