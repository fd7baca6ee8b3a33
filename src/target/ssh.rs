use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{ExecCommand, ProcessExec, Target, TransportError};

const DEFAULT_PORT: u16 = 22;
const DEFAULT_CONTROL_PERSIST_SECS: u32 = 600;

/// SSH transport driving the system OpenSSH client.
///
/// All sessions share one pooled master connection
/// (`ControlMaster=auto`), so per-command overhead is a socket
/// round-trip rather than a handshake. `reconnect` tears the master
/// down; the next command re-dials, picking up remote-side changes
/// such as new group memberships.
///
/// Authentication is the ssh client's business (agent, keys, config).
pub struct SshTarget {
    user: String,
    host: String,
    port: u16,
    control_path: PathBuf,
    control_persist_secs: u32,
}

impl SshTarget {
    /// Parse an address of the form `[user@]host[:port]`. User
    /// defaults to `root`, port to 22.
    pub fn new(address: &str) -> Self {
        let (rest, port) = match address.rsplit_once(':') {
            Some((rest, port)) => (rest, port.parse().unwrap_or(DEFAULT_PORT)),
            None => (address, DEFAULT_PORT),
        };
        let (user, host) = match rest.split_once('@') {
            Some((user, host)) => (user.to_string(), host.to_string()),
            None => ("root".to_string(), rest.to_string()),
        };
        let control_path =
            std::env::temp_dir().join(format!("groundwork-{user}-{host}-{port}.ctl"));
        Self {
            user,
            host,
            port,
            control_path,
            control_persist_secs: DEFAULT_CONTROL_PERSIST_SECS,
        }
    }

    /// How long the pooled master connection stays alive after the
    /// last session.
    pub fn control_persist(mut self, secs: u32) -> Self {
        self.control_persist_secs = secs;
        self
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    fn base_args(&self) -> Vec<String> {
        vec![
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
            "-o".to_string(),
            format!("ControlPersist={}s", self.control_persist_secs),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-p".to_string(),
            self.port.to_string(),
            self.destination(),
        ]
    }
}

#[async_trait]
impl Target for SshTarget {
    fn user(&self) -> &str {
        &self.user
    }

    fn address(&self) -> String {
        self.host.clone()
    }

    async fn command(&self, cmdline: &str) -> Result<Box<dyn ExecCommand>, TransportError> {
        let mut command = Command::new("ssh");
        command.args(self.base_args()).arg(cmdline);
        Ok(Box::new(ProcessExec::new("ssh", command)))
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        let output = Command::new("ssh")
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg("-O")
            .arg("exit")
            .arg(self.destination())
            .output()
            .await?;
        if !output.status.success() {
            // No master to tear down; the next command dials fresh.
            debug!(
                host = %self.host,
                "no ssh master connection to close: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}
