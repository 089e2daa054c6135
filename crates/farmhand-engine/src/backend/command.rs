//! Execution of external scheduler commands.
//!
//! Every call a backend makes to a scheduler CLI goes through a
//! [`CommandRunner`]. The system runner drains stdout and stderr of the child
//! on separate tasks; scheduler tools are known to block on a full stderr
//! pipe while the caller is still waiting on stdout.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::debug;
use tracing::trace;
use tracing::warn;

/// Represents an error from running an external command.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// The command could not be spawned.
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        /// The program that failed to spawn.
        program: String,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The command exited unsuccessfully.
    #[error("`{program}` exited with {status}: {stderr}")]
    Failed {
        /// The program that failed.
        program: String,
        /// A description of the exit status.
        status: String,
        /// The standard error output of the command.
        stderr: String,
    },

    /// The command did not finish in time and was killed.
    #[error("`{program}` timed out after {secs} second(s)")]
    TimedOut {
        /// The program that timed out.
        program: String,
        /// The timeout in seconds.
        secs: u64,
    },

    /// The command succeeded but its standard output is not UTF-8.
    #[error("`{program}` wrote output that is not valid UTF-8")]
    InvalidUtf8 {
        /// The program that wrote the output.
        program: String,
    },

    /// Waiting on the command failed.
    #[error("failed to wait for `{program}`: {source}")]
    Wait {
        /// The program that was being waited on.
        program: String,
        /// The underlying I/O error.
        source: std::io::Error,
    },
}

/// Represents a command to run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    /// The program to run.
    program: String,
    /// The arguments to the program.
    args: Vec<String>,
    /// Environment variables to set in addition to the inherited environment.
    env: HashMap<String, String>,
    /// The working directory of the command.
    ///
    /// A value of `None` inherits the current directory.
    working_dir: Option<PathBuf>,
    /// The maximum amount of time the command may run.
    timeout: Option<Duration>,
}

impl CommandSpec {
    /// Creates a new command specification for the given program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Adds an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Adds multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets an environment variable for the command.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets the working directory of the command.
    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.working_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Sets the timeout of the command.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Gets the program of the command.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Gets the arguments of the command.
    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Gets the environment overrides of the command.
    pub fn environment(&self) -> &HashMap<String, String> {
        &self.env
    }

    /// Gets the working directory of the command.
    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    /// Gets the timeout of the command.
    pub fn time_limit(&self) -> Option<Duration> {
        self.timeout
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }

        Ok(())
    }
}

/// Represents something that runs external commands.
#[async_trait]
pub trait CommandRunner: Send + Sync + fmt::Debug {
    /// Runs the given command to completion.
    ///
    /// Returns the standard output of the command.
    async fn run(&self, command: &CommandSpec) -> Result<String, CommandError>;
}

/// A command runner that spawns processes on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner;

impl SystemCommandRunner {
    /// Constructs a new system command runner.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<String, CommandError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        debug!(command = %spec, "spawning external command");

        let mut child = command.spawn().map_err(|source| CommandError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        // Both pipes are always requested above, so a missing pipe only means
        // there is nothing to drain
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stdout_task = tokio::spawn(drain(stdout, spec.program.clone()));
        let stderr_task = tokio::spawn(drain(stderr, spec.program.clone()));

        let wait = async {
            let status = child.wait().await;
            let (stdout, stderr) = futures::join!(stdout_task, stderr_task);
            (status, stdout.unwrap_or_default(), stderr.unwrap_or_default())
        };

        let (status, stdout, stderr) = match spec.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, wait).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(CommandError::TimedOut {
                        program: spec.program.clone(),
                        secs: timeout.as_secs(),
                    });
                }
            },
            None => wait.await,
        };

        let status = status.map_err(|source| CommandError::Wait {
            program: spec.program.clone(),
            source,
        })?;

        let stderr = String::from_utf8_lossy(&stderr);
        if !stderr.trim().is_empty() {
            warn!(command = %spec, stderr = %stderr.trim_end(), "command wrote to stderr");
        }

        if !status.success() {
            return Err(CommandError::Failed {
                program: spec.program.clone(),
                status: status.to_string(),
                stderr: stderr.trim_end().to_string(),
            });
        }

        let stdout = String::from_utf8(stdout).map_err(|_| CommandError::InvalidUtf8 {
            program: spec.program.clone(),
        })?;
        for line in stdout.lines() {
            trace!(stdout = line, program = %spec.program);
        }

        Ok(stdout)
    }
}

/// Reads a pipe of a child to its end.
///
/// A read error ends the output early; whatever was read is kept.
async fn drain<R>(pipe: Option<R>, program: String) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let mut output = Vec::new();
    if let Some(mut pipe) = pipe
        && let Err(e) = pipe.read_to_end(&mut output).await
    {
        debug!(%program, "failed to read output of command: {e}");
    }
    output
}
