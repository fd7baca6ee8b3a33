//! # groundwork
//!
//! Incremental, resumable host provisioning over SSH or a local
//! shell.
//!
//! A host's desired state is described as a package of tasks, each an
//! ordered list of shell commands. Every command gets a fingerprint
//! chaining it to everything before it in its task; completed
//! commands leave marker files on the target, so a rerun skips all
//! work that is still valid and re-executes exactly the tail that
//! changed.
//!
//! ## Modules
//!
//! - `build` - the provisioning run: cache reconciliation and command execution
//! - `checksum` - rolling SHA-256 fingerprints over a task's command sequence
//! - `command` - the `Command` trait and built-in variants (shell, file, packages, …)
//! - `package` - composable bundles of tasks rendered from configuration templates
//! - `pubsub` - non-blocking lifecycle event bus and the stdout logger
//! - `target` - transports that spawn remote processes (SSH, local shell)
//! - `task` - named, ordered command lists sharing a cache namespace
//! - `template` - `{{ .Field }}` substitution over configuration structs
//! - `validate` - declarative validation of configuration fields
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use groundwork::{Build, LocalTarget, Package};
//! use groundwork::command::{install_packages, shell};
//!
//! # async fn provision() -> groundwork::Result<()> {
//! let mut pkg = Package::new();
//! pkg.add_commands("base", vec![
//!     shell("apt-get update"),
//!     install_packages(["curl", "htop"]),
//! ])?;
//!
//! Build::new(Arc::new(LocalTarget::new())).run(&mut pkg).await
//! # }
//! ```

pub mod build;
pub mod checksum;
pub mod command;
pub mod error;
pub mod package;
pub mod pubsub;
pub mod target;
pub mod task;
pub mod template;
pub mod validate;

pub use build::Build;
pub use command::Command;
pub use error::Error;
pub use package::{Package, Template};
pub use pubsub::{EventBus, Message, StdoutLogger};
pub use target::{LocalTarget, SshTarget, Target};
pub use task::Task;

use std::sync::Arc;

/// Standard result type for library operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Render `tpl` into a package and provision it on `target` with
/// default settings.
pub async fn provision<T: Template>(target: Arc<dyn Target>, tpl: &mut T) -> Result<()> {
    let mut pkg = Package::from_template(tpl)?;
    Build::new(target).run(&mut pkg).await
}

/// Like [`provision`], but only report what would be executed or
/// invalidated.
pub async fn provision_dry_run<T: Template>(target: Arc<dyn Target>, tpl: &mut T) -> Result<()> {
    let mut pkg = Package::from_template(tpl)?;
    Build::new(target).dry_run(true).run(&mut pkg).await
}
