//! Commands: the smallest unit of remote work.
//!
//! Every command produces a shell string to execute and a one-line
//! human description for logging. The optional capabilities —
//! template rendering, post-render validation, fingerprint override,
//! piped stdin — are defaulted trait methods, so a variant opts in by
//! overriding them.

mod download;
mod file;
mod packages;
mod shell;
mod upstart;

pub use download::DownloadExtract;
pub use file::WriteFile;
pub use packages::InstallPackages;
pub use shell::ShellCommand;
pub use upstart::UpstartService;

use serde_json::Value;

pub trait Command: Send + Sync {
    /// The shell string executed on the target. Must be deterministic
    /// once `render` has run; fingerprints are computed from it.
    fn shell(&self) -> String;

    /// One-line human description used in events and log output.
    fn log(&self) -> String {
        self.shell()
    }

    /// Substitute configuration fields into templated strings.
    fn render(&mut self, _ctx: &Value) -> crate::Result<()> {
        Ok(())
    }

    /// Post-render sanity check.
    fn validate(&self) -> crate::Result<()> {
        Ok(())
    }

    /// Fingerprint override. The rolling task checksum is still fed
    /// with `shell()` so later commands chain correctly.
    fn checksum(&self) -> Option<String> {
        None
    }

    /// Bytes piped into the remote process's stdin.
    fn stdin(&self) -> Option<Vec<u8>> {
        None
    }
}

/// A raw shell command.
pub fn shell(cmd: impl Into<String>) -> Box<dyn Command> {
    Box::new(ShellCommand::new(cmd))
}

/// Write `content` to `path` on the target.
pub fn write_file(path: impl Into<String>, content: impl Into<String>) -> Box<dyn Command> {
    Box::new(WriteFile::new(path, content))
}

/// Install the given OS packages.
pub fn install_packages<I, S>(packages: I) -> Box<dyn Command>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Box::new(InstallPackages::new(packages))
}

/// Download an archive and extract it below `dest`.
pub fn download_extract(url: impl Into<String>, dest: impl Into<String>) -> Box<dyn Command> {
    Box::new(DownloadExtract::new(url, dest))
}

/// Register an upstart unit running `exec`.
pub fn upstart(name: impl Into<String>, exec: impl Into<String>) -> Box<dyn Command> {
    Box::new(UpstartService::new(name, exec))
}
