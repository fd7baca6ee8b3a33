use async_trait::async_trait;
use tokio::process::Command;

use super::{ExecCommand, ProcessExec, Target, TransportError};

/// Runs commands in a local shell. This is the transport for
/// provisioning the machine the engine runs on, e.g. inside a
/// container being built.
pub struct LocalTarget {
    user: String,
}

impl LocalTarget {
    pub fn new() -> Self {
        Self {
            user: "root".to_string(),
        }
    }

    pub fn with_user(user: impl Into<String>) -> Self {
        Self { user: user.into() }
    }
}

impl Default for LocalTarget {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Target for LocalTarget {
    fn user(&self) -> &str {
        &self.user
    }

    fn address(&self) -> String {
        "localhost".to_string()
    }

    async fn command(&self, cmdline: &str) -> Result<Box<dyn ExecCommand>, TransportError> {
        let mut command = Command::new("sh");
        command.arg("-c").arg(cmdline);
        Ok(Box::new(ProcessExec::new("sh", command)))
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        Ok(())
    }
}
