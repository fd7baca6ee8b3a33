use thiserror::Error;

use crate::target::{ExitStatus, TransportError};
use crate::template::RenderError;
use crate::validate::ValidationError;

/// The unified error type for the provisioning engine.
///
/// Everything a caller can observe failing maps onto one of these
/// variants; the contained sub-errors carry the module-specific
/// detail (field names, exit statuses, offending fingerprints).
#[derive(Error, Debug)]
pub enum Error {
    /// A configuration value failed validation. Raised during package
    /// construction or precompilation, before any remote action.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(#[from] ValidationError),

    /// Template rendering failed (missing field or parse error).
    #[error("template rendering failed: {0}")]
    Template(#[from] RenderError),

    /// The remote transport failed (connect, spawn, broken pipe).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A provisioned command exited non-zero. The failure marker has
    /// already been written when this is returned.
    #[error("command {log:?} failed with {status}")]
    CommandFailed { log: String, status: ExitStatus },

    /// A cache marker with a malformed fingerprint was found on the
    /// target. The cache must not be trusted in this state.
    #[error("invalid fingerprint {fingerprint:?} cached for task {task:?}")]
    CachePoisoned { task: String, fingerprint: String },

    /// Published messages were dropped because a subscriber buffer
    /// was full. Reported by `Subscription::close`, never fatal to a
    /// provisioning run.
    #[error("{count} published messages ignored (subscriber buffer full)")]
    IgnoredMessages { count: u64 },

    /// Task precompilation panicked; the payload and a captured
    /// backtrace were published under the `panic` event state.
    #[error("task {task:?} failed to precompile: {message}")]
    Precompile { task: String, message: String },

    #[error("task name must not be empty")]
    EmptyTaskName,

    #[error("task name {0:?} must not contain whitespace")]
    TaskNameWhitespace(String),

    #[error("task name prefix \"gw.\" is reserved (in {0:?})")]
    ReservedTaskName(String),

    #[error("task {0:?} exists already")]
    DuplicateTask(String),
}

impl Error {
    /// Exit code suitable for a driver binary: non-zero for every
    /// variant, with command failures forwarding the remote status.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::CommandFailed { status, .. } => status.code().unwrap_or(1),
            _ => 1,
        }
    }
}
