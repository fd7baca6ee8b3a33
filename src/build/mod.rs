//! The provisioning run: cache reconciliation and command execution.
//!
//! A [`Build`] binds a package to a target. Running it precompiles
//! the package, prepares the cache directory on the target, scans the
//! existing `.done` markers into the in-memory checksum tree, and
//! walks tasks and commands in order, skipping everything still
//! covered by the cache. The first command whose fingerprint diverges
//! invalidates all remaining markers of its task; from there on the
//! tail is executed again.

mod checksum_tree;
mod runner;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;

use crate::checksum::ChecksumChain;
use crate::command::Command;
use crate::error::Error;
use crate::package::Package;
use crate::pubsub::{EventBus, EventKey, ExecStatus, Message};
use crate::target::{sudo_wrap, ExecCommand, Target, TransportError};
use crate::task::Task;
use checksum_tree::ChecksumTree;
use runner::CommandRunner;

/// Default cache root on the target.
pub const DEFAULT_CACHE_ROOT: &str = "/var/lib/groundwork";

/// Default shared group owning the cache tree.
pub const DEFAULT_GROUP: &str = "groundwork";

/// One provisioning run against one target.
pub struct Build {
    target: Arc<dyn Target>,
    env: Vec<String>,
    cache_root: String,
    group: Option<String>,
    dry_run: bool,
    bus: EventBus,
}

impl Build {
    pub fn new(target: Arc<dyn Target>) -> Self {
        Self {
            target,
            env: Vec::new(),
            cache_root: DEFAULT_CACHE_ROOT.to_string(),
            group: Some(DEFAULT_GROUP.to_string()),
            dry_run: false,
            bus: EventBus::default(),
        }
    }

    /// Add a `KEY=value` environment export injected into every
    /// command script.
    pub fn env(mut self, export: impl Into<String>) -> Self {
        self.env.push(export.into());
        self
    }

    pub fn cache_root(mut self, root: impl Into<String>) -> Self {
        self.cache_root = root.into();
        self
    }

    /// Shared group owning the cache tree. `None` skips group
    /// management entirely (unprivileged targets); prepare then only
    /// creates the cache directory.
    pub fn group(mut self, group: Option<String>) -> Self {
        self.group = group;
        self
    }

    /// Walk the full reconcile loop without executing anything.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Publish lifecycle events into `bus` instead of a private one.
    pub fn bus(mut self, bus: EventBus) -> Self {
        self.bus = bus;
        self
    }

    /// Provision `pkg` on the target.
    pub async fn run(&self, pkg: &mut Package) -> crate::Result<()> {
        pkg.precompile(&self.bus)?;
        self.prepare().await?;
        let mut tree = self.build_checksum_tree().await?;

        for task in pkg.tasks_mut() {
            let mut message = Message::new(EventKey::Provision, self.hostname());
            message.task_name = task.name().to_string();
            self.bus.publish(message.with_state("started"));
            match self.provision_task(task, &mut tree).await {
                Ok(()) => self.bus.publish(message.with_state("finished")),
                Err(e) => {
                    message.error = Some(e.to_string());
                    self.bus.publish(message.with_state("failed"));
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// One-time per-run preparation: the shared group exists, the
    /// invoking user is a member, and the cache root is a setgid
    /// directory owned by the group. The transport reconnects
    /// afterwards so fresh group membership takes effect.
    async fn prepare(&self) -> crate::Result<()> {
        match &self.group {
            Some(group) => {
                let user = self.target.user();
                let script = [
                    format!("grep -q '^{group}:' /etc/group || groupadd {group}"),
                    format!("id -nG {user} | grep -qw {group} || usermod -a -G {group} {user}"),
                    format!("mkdir -m2775 -p {}", self.cache_root),
                    format!("chgrp {group} {}", self.cache_root),
                    format!("chmod 2775 {}", self.cache_root),
                ]
                .join(" && ");
                self.run_internal(&script).await?;
                self.target.reconnect().await?;
            }
            None => {
                self.run_internal(&format!("mkdir -p {}", self.cache_root))
                    .await?;
            }
        }
        Ok(())
    }

    /// Scan the `.done` markers on the target into the cache tree.
    async fn build_checksum_tree(&self) -> crate::Result<ChecksumTree> {
        let output = self
            .run_internal(&format!(
                r"[ -d {root} ] && find {root} -type f -name \*.done",
                root = self.cache_root
            ))
            .await?;
        checksum_tree::parse(&self.cache_root, &output)
    }

    async fn provision_task(&self, task: &mut Task, tree: &mut ChecksumTree) -> crate::Result<()> {
        let task_name = task.name().to_string();
        let dir = format!("{}/{}", self.cache_root, task_name);

        let mut cached = match tree.remove(&task_name) {
            Some(fingerprints) => fingerprints,
            None => {
                // New files inherit the directory's group, so every
                // operator account in the group shares this cache.
                self.run_internal(&format!("mkdir -m2775 -p {dir}")).await?;
                HashSet::new()
            }
        };

        let task_started = Utc::now();
        let mut chain = ChecksumChain::new();
        for command in task.commands(&self.bus)? {
            let rolling = chain.push(&command.shell());
            let fingerprint = command.checksum().unwrap_or(rolling);

            let mut message = Message::new(EventKey::ProvisionTask, self.hostname());
            message.task_name = task_name.clone();
            message.fingerprint = Some(fingerprint.clone());
            message.message = Some(command.log());

            if cached.remove(&fingerprint) {
                message.exec_status = Some(ExecStatus::Cached);
                self.bus.publish(message.with_state("finished"));
                continue;
            }

            // Something above this command changed: every remaining
            // marker belongs to a command sequence that no longer
            // exists.
            if !cached.is_empty() {
                self.invalidate_cached_entries(&task_name, &dir, &cached)
                    .await?;
                cached.clear();
            }

            message.exec_status = Some(ExecStatus::ExecStart);
            if self.dry_run {
                self.bus.publish(message.with_state("executed"));
                continue;
            }
            self.bus.publish(message.with_state("started"));

            let started = Instant::now();
            let runner = CommandRunner {
                build: self,
                dir: &dir,
                task_name: &task_name,
                task_started,
            };
            let result = runner.run(command.as_ref(), &fingerprint).await;

            message.exec_status = Some(ExecStatus::ExecFinished);
            message.total_runtime = Some(started.elapsed());
            if let Err(e) = &result {
                message.error = Some(e.to_string());
            }
            self.bus.publish(message.with_state("finished"));
            result?;
        }
        Ok(())
    }

    async fn invalidate_cached_entries(
        &self,
        task_name: &str,
        dir: &str,
        cached: &HashSet<String>,
    ) -> crate::Result<()> {
        let mut entries: Vec<String> = cached.iter().map(|fp| format!("{fp}.done")).collect();
        entries.sort();

        if self.dry_run {
            let mut message = Message::new(EventKey::CleanupCacheEntries, self.hostname());
            message.task_name = task_name.to_string();
            message.invalidated = Some(entries);
            self.bus.publish(message.with_state("dryrun"));
            return Ok(());
        }

        let mut message = Message::new(EventKey::Internal, self.hostname());
        message.task_name = task_name.to_string();
        self.bus.publish(message.with_state("started"));
        self.run_internal(&format!(
            "cd {dir} && rm -f *.failed {}",
            entries.join(" ")
        ))
        .await?;
        self.bus.publish(message.with_state("finished"));
        Ok(())
    }

    /// Run an engine-internal command on the target, capturing its
    /// output. Non-zero exit is a transport failure carrying the
    /// remote stderr.
    pub(crate) async fn run_internal(&self, cmdline: &str) -> crate::Result<String> {
        use tokio::io::AsyncReadExt;

        let wrapped = self.prepare_cmdline(cmdline);
        let mut exec = self.target.command(&wrapped).await?;
        exec.start().await?;
        let mut stdout_pipe = exec.stdout_pipe()?;
        let mut stderr_pipe = exec.stderr_pipe()?;
        let mut stdout = String::new();
        let mut stderr = String::new();
        futures::try_join!(
            stdout_pipe.read_to_string(&mut stdout),
            stderr_pipe.read_to_string(&mut stderr)
        )
        .map_err(TransportError::Io)?;
        let status = exec.wait().await?;
        if !status.success() {
            return Err(Error::Transport(TransportError::Failed {
                cmdline: cmdline.to_string(),
                status,
                stderr: stderr.trim().to_string(),
            }));
        }
        Ok(stdout)
    }

    /// Apply privilege escalation for provisioning commands when the
    /// target user is not root.
    pub(crate) fn prepare_cmdline(&self, cmdline: &str) -> String {
        if self.target.user() != "root" {
            sudo_wrap(cmdline)
        } else {
            cmdline.to_string()
        }
    }

    pub(crate) fn hostname(&self) -> String {
        self.target.address()
    }
}
