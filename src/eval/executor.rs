//! Command executor
//!
//! Runs rendered operator commands and stamping tools, capturing output and
//! exit codes. Everything blocks until the child exits.
use std::io;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

use crate::logging::operations;

/// How a command is spelled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandLine {
    /// Passed to `sh -c`; values must already be quoted
    Shell(String),
    /// Program and arguments, no shell involved
    Argv(Vec<String>),
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandLine::Shell(script) => f.write_str(script),
            CommandLine::Argv(argv) => f.write_str(&argv.join(" ")),
        }
    }
}

/// One command to run
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Short name for logs (operator or tool name)
    pub label: String,
    pub command: CommandLine,
    pub inputs: Vec<PathBuf>,
    /// Files the command is expected to produce
    pub outputs: Vec<PathBuf>,
}

/// Result of running a command
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub success: bool,
    pub exit_code: i32,
    pub duration: Duration,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutcome {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("Empty command line")]
    EmptyCommand,
}

/// Something that can run commands synchronously
pub trait CommandExecutor: Send + Sync {
    fn execute(&self, invocation: &Invocation) -> Result<ExecOutcome, ExecError>;
}

/// Runs commands as local subprocesses
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor {
    verbose: bool,
}

impl ShellExecutor {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl CommandExecutor for ShellExecutor {
    fn execute(&self, invocation: &Invocation) -> Result<ExecOutcome, ExecError> {
        let start = Instant::now();

        let mut cmd = match &invocation.command {
            CommandLine::Shell(script) => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(script);
                cmd
            }
            CommandLine::Argv(argv) => {
                let (program, args) = argv.split_first().ok_or(ExecError::EmptyCommand)?;
                // Resolve from PATH, falling back to the name as given
                let program = which::which(program).unwrap_or_else(|_| PathBuf::from(program));
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
        };

        if self.verbose {
            eprintln!("[geoflow] Executing {}: {}", invocation.label, invocation.command);
        }
        debug!(
            operation = operations::EXECUTE,
            label = %invocation.label,
            command = %invocation.command,
            "running command"
        );

        let output = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|source| ExecError::Spawn {
                command: invocation.command.to_string(),
                source,
            })?;

        let duration = start.elapsed();
        let exit_code = output.status.code().unwrap_or(-1);

        if self.verbose {
            eprintln!(
                "[geoflow] Completed in {:.2}s with exit code {}",
                duration.as_secs_f64(),
                exit_code
            );
        }

        Ok(ExecOutcome {
            success: output.status.success(),
            exit_code,
            duration,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}
