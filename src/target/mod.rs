//! Target transports: how remote processes are spawned.
//!
//! A [`Target`] turns a command line into an [`ExecCommand`] with the
//! capabilities of a spawned subprocess. The engine drives every
//! remote effect through this seam, so an SSH host, a local container
//! shell, and a test double are interchangeable.

mod local;
mod ssh;

pub use local::LocalTarget;
pub use ssh::SshTarget;

use std::fmt;
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to spawn {program:?}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("transport i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("process has not been started")]
    NotStarted,

    #[error("process was already started")]
    AlreadyStarted,

    #[error("{stream} pipe already taken")]
    PipeTaken { stream: &'static str },

    #[error("command {cmdline:?} failed with {status}: {stderr}")]
    Failed {
        cmdline: String,
        status: ExitStatus,
        stderr: String,
    },
}

/// Exit status of a remote process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Error(i32),
    Signal(i32),
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Success)
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Success => Some(0),
            ExitStatus::Error(code) => Some(*code),
            ExitStatus::Signal(_) => None,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Success => write!(f, "exit status 0"),
            ExitStatus::Error(code) => write!(f, "exit status {code}"),
            ExitStatus::Signal(signal) => write!(f, "signal {signal}"),
        }
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        if status.success() {
            return ExitStatus::Success;
        }
        if let Some(code) = status.code() {
            return ExitStatus::Error(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ExitStatus::Signal(signal);
            }
        }
        ExitStatus::Error(1)
    }
}

/// Spawns remote processes. Implementations: [`SshTarget`],
/// [`LocalTarget`], test doubles.
#[async_trait]
pub trait Target: Send + Sync {
    /// Account the transport logs in as.
    fn user(&self) -> &str;

    /// Address used in event messages.
    fn address(&self) -> String;

    /// Prepare (but do not start) a remote process running `cmdline`.
    async fn command(&self, cmdline: &str) -> Result<Box<dyn ExecCommand>, TransportError>;

    /// Drop any pooled connection so the next command establishes a
    /// fresh session. Needed after changing the remote user's group
    /// membership.
    async fn reconnect(&self) -> Result<(), TransportError>;
}

/// A spawned (or to-be-spawned) remote process. Pipes become
/// available after `start` and can each be taken once.
#[async_trait]
pub trait ExecCommand: Send {
    async fn start(&mut self) -> Result<(), TransportError>;

    fn stdin_pipe(&mut self) -> Result<Box<dyn AsyncWrite + Send + Unpin>, TransportError>;

    fn stdout_pipe(&mut self) -> Result<Box<dyn AsyncRead + Send + Unpin>, TransportError>;

    fn stderr_pipe(&mut self) -> Result<Box<dyn AsyncRead + Send + Unpin>, TransportError>;

    async fn wait(&mut self) -> Result<ExitStatus, TransportError>;

    /// Convenience: `start` followed by `wait`.
    async fn run(&mut self) -> Result<ExitStatus, TransportError> {
        self.start().await?;
        self.wait().await
    }
}

/// Wrap a command line for privilege escalation.
pub fn sudo_wrap(cmdline: &str) -> String {
    format!("sudo bash <<EOF_GW_SUDO\n{cmdline}\nEOF_GW_SUDO\n")
}

/// [`ExecCommand`] over a local [`tokio::process::Command`]. Both
/// built-in targets spawn their processes through this type; only the
/// program differs (`sh` locally, the `ssh` client for remote hosts).
pub(crate) struct ProcessExec {
    program: String,
    command: Option<Command>,
    child: Option<Child>,
}

impl ProcessExec {
    pub(crate) fn new(program: impl Into<String>, command: Command) -> Self {
        Self {
            program: program.into(),
            command: Some(command),
            child: None,
        }
    }
}

#[async_trait]
impl ExecCommand for ProcessExec {
    async fn start(&mut self) -> Result<(), TransportError> {
        let mut command = self.command.take().ok_or(TransportError::AlreadyStarted)?;
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let child = command.spawn().map_err(|source| TransportError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        self.child = Some(child);
        Ok(())
    }

    fn stdin_pipe(&mut self) -> Result<Box<dyn AsyncWrite + Send + Unpin>, TransportError> {
        let child = self.child.as_mut().ok_or(TransportError::NotStarted)?;
        child
            .stdin
            .take()
            .map(|pipe| Box::new(pipe) as Box<dyn AsyncWrite + Send + Unpin>)
            .ok_or(TransportError::PipeTaken { stream: "stdin" })
    }

    fn stdout_pipe(&mut self) -> Result<Box<dyn AsyncRead + Send + Unpin>, TransportError> {
        let child = self.child.as_mut().ok_or(TransportError::NotStarted)?;
        child
            .stdout
            .take()
            .map(|pipe| Box::new(pipe) as Box<dyn AsyncRead + Send + Unpin>)
            .ok_or(TransportError::PipeTaken { stream: "stdout" })
    }

    fn stderr_pipe(&mut self) -> Result<Box<dyn AsyncRead + Send + Unpin>, TransportError> {
        let child = self.child.as_mut().ok_or(TransportError::NotStarted)?;
        child
            .stderr
            .take()
            .map(|pipe| Box::new(pipe) as Box<dyn AsyncRead + Send + Unpin>)
            .ok_or(TransportError::PipeTaken { stream: "stderr" })
    }

    async fn wait(&mut self) -> Result<ExitStatus, TransportError> {
        let child = self.child.as_mut().ok_or(TransportError::NotStarted)?;
        let status = child.wait().await?;
        Ok(status.into())
    }
}
