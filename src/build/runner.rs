//! Executing one command on the target.
//!
//! A command run leaves four artifacts in its task's cache directory:
//! the script as written (`<fp>.sh`, moved to the marker on
//! completion), the outcome marker (`<fp>.done` or `<fp>.failed`),
//! the captured output (`<fp>.log`), and an appended line in the
//! per-run manifest (`<timestamp>.run`).
//!
//! While the script runs, three workers cooperate: readers on stdout
//! and stderr publish `task.io` events and feed timestamped records
//! into a bounded channel, and a sink relays that channel into a
//! second remote process writing the log file. The marker is only
//! written after both readers hit EOF and the sink has drained.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tracing::warn;

use super::Build;
use crate::command::Command;
use crate::error::Error;
use crate::pubsub::{EventBus, EventKey, Message};
use crate::target::{ExecCommand, Target, TransportError};

const LOG_CHANNEL_CAPACITY: usize = 256;

pub(crate) struct CommandRunner<'a> {
    pub build: &'a Build,
    pub dir: &'a str,
    pub task_name: &'a str,
    pub task_started: DateTime<Utc>,
}

impl CommandRunner<'_> {
    pub(crate) async fn run(&self, command: &dyn Command, fingerprint: &str) -> crate::Result<()> {
        let prefix = format!("{}/{}", self.dir, fingerprint);
        self.write_script(&prefix, command).await?;

        let (log_tx, log_rx) = mpsc::channel::<String>(LOG_CHANNEL_CAPACITY);
        let sink = tokio::spawn(write_remote_log(
            Arc::clone(&self.build.target),
            format!("{prefix}.log"),
            log_rx,
        ));

        let cmdline = self.build.prepare_cmdline(&format!("sh {prefix}.sh"));
        let mut exec = self.build.target.command(&cmdline).await?;
        exec.start().await?;

        if let Some(input) = command.stdin() {
            let mut stdin = exec.stdin_pipe()?;
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&input).await {
                    warn!("failed to feed command stdin: {e}");
                }
                let _ = stdin.shutdown().await;
            });
        }

        let command_started = Instant::now();
        let base = self.io_message(command);
        let stdout_reader = tokio::spawn(forward_stream(
            exec.stdout_pipe()?,
            "stdout",
            self.build.bus.clone(),
            base.clone(),
            log_tx.clone(),
            command_started,
        ));
        let stderr_reader = tokio::spawn(forward_stream(
            exec.stderr_pipe()?,
            "stderr",
            self.build.bus.clone(),
            base,
            log_tx,
            command_started,
        ));

        let status = exec.wait().await;

        // Both streams must reach EOF before the log channel closes,
        // and the sink must flush before the marker is written.
        let stdout_result = stdout_reader.await;
        let stderr_result = stderr_reader.await;
        let sink_result = sink.await;

        let failed = !matches!(&status, Ok(s) if s.success());
        self.write_marker(&prefix, failed).await?;

        let status = status?;
        if !status.success() {
            return Err(Error::CommandFailed {
                log: command.log(),
                status,
            });
        }
        flatten_reader(stdout_result)?;
        flatten_reader(stderr_result)?;
        flatten_join(sink_result)?;
        Ok(())
    }

    /// Materialize the script on the target via a quoted heredoc, so
    /// nothing in the command body is expanded in transit.
    async fn write_script(&self, prefix: &str, command: &dyn Command) -> crate::Result<()> {
        let env: String = self
            .build
            .env
            .iter()
            .map(|export| format!("export {export}\n"))
            .collect();
        let script = format!(
            "cat <<\"EOSCRIPT\" > {prefix}.sh\n#!/bin/sh\nset -e\nset -x\n\n{env}{shell}\nEOSCRIPT\n",
            shell = command.shell()
        );
        self.build.run_internal(&script).await.map(|_| ())
    }

    /// Place the outcome marker and append it to the per-run
    /// manifest. The script file becomes the marker, so a `.failed`
    /// marker carries the script body that failed.
    async fn write_marker(&self, prefix: &str, failed: bool) -> crate::Result<()> {
        let suffix = if failed { "failed" } else { "done" };
        let marker = format!("{prefix}.{suffix}");
        let manifest = format!(
            "{}/{}.run",
            self.dir,
            self.task_started.format("%Y%m%d_%H%M%S")
        );
        let cmdline = format!(
            "{{ [ -f {marker} ] || mv {prefix}.sh {marker}; }} && echo {marker} >> {manifest}"
        );
        self.build.run_internal(&cmdline).await.map(|_| ())
    }

    fn io_message(&self, command: &dyn Command) -> Message {
        let mut message = Message::new(EventKey::TaskIo, self.build.hostname());
        message.task_name = self.task_name.to_string();
        message.message = Some(command.log());
        message
    }
}

async fn forward_stream(
    stream: Box<dyn AsyncRead + Send + Unpin>,
    name: &'static str,
    bus: EventBus,
    base: Message,
    log_tx: mpsc::Sender<String>,
    command_started: Instant,
) -> std::io::Result<()> {
    let mut lines = BufReader::new(stream).lines();
    let mut sink_open = true;
    while let Some(line) = lines.next_line().await? {
        let mut message = base.clone();
        message.stream = Some(name);
        message.line = Some(line.clone());
        message.total_runtime = Some(command_started.elapsed());
        bus.publish(message.with_state(name));

        if sink_open {
            let record = format!(
                "{}\t{}\t{}",
                Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
                name,
                line
            );
            // If the sink died, keep draining so the process is
            // never blocked on a full pipe.
            sink_open = log_tx.send(record).await.is_ok();
        }
    }
    Ok(())
}

/// Relay log records into `cat - > <path>` on the target. Runs on a
/// dedicated transport command and is never sudo-wrapped; the shared
/// group makes the task directory writable.
async fn write_remote_log(
    target: Arc<dyn Target>,
    path: String,
    mut records: mpsc::Receiver<String>,
) -> crate::Result<()> {
    let mut exec = target.command(&format!("cat - > {path}")).await?;
    exec.start().await?;
    let mut stdin = exec.stdin_pipe()?;

    let mut write_error: Option<std::io::Error> = None;
    while let Some(record) = records.recv().await {
        let written = async {
            stdin.write_all(record.as_bytes()).await?;
            stdin.write_all(b"\n").await
        }
        .await;
        if let Err(e) = written {
            write_error = Some(e);
            break;
        }
    }
    // Unblock the readers before waiting for the sink process.
    records.close();
    let _ = stdin.shutdown().await;
    drop(stdin);

    let status = exec.wait().await?;
    if let Some(e) = write_error {
        return Err(Error::Transport(TransportError::Io(e)));
    }
    if !status.success() {
        return Err(Error::Transport(TransportError::Failed {
            cmdline: format!("cat - > {path}"),
            status,
            stderr: String::new(),
        }));
    }
    Ok(())
}

fn flatten_reader(result: Result<std::io::Result<()>, JoinError>) -> crate::Result<()> {
    flatten_join(result.map(|inner| inner.map_err(|e| Error::Transport(TransportError::Io(e)))))
}

fn flatten_join(result: Result<crate::Result<()>, JoinError>) -> crate::Result<()> {
    match result {
        Ok(inner) => inner,
        Err(e) => Err(Error::Transport(TransportError::Io(std::io::Error::other(
            e,
        )))),
    }
}
