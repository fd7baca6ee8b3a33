//! Single-process publish/subscribe channel for lifecycle events.
//!
//! Publication never blocks: the bus is a broadcast channel, and a
//! subscriber that falls behind loses the oldest messages. Every
//! dropped message is counted and surfaced when the subscription is
//! closed, so slow consumers are detected without ever stalling a
//! provisioning run.

mod logger;

pub use logger::StdoutLogger;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::error::Error;

const KEY_PREFIX: &str = "groundwork";
const DEFAULT_CAPACITY: usize = 1024;

/// The fixed set of event keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKey {
    /// `groundwork.runlists.precompile`
    Precompile,
    /// `groundwork.runlists.provision`
    Provision,
    /// `groundwork.runlists.provision.task`
    ProvisionTask,
    /// `groundwork.cleanup.cache-entries`
    CleanupCacheEntries,
    /// `groundwork.internal`
    Internal,
    /// `task.io`
    TaskIo,
}

impl EventKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKey::Precompile => "groundwork.runlists.precompile",
            EventKey::Provision => "groundwork.runlists.provision",
            EventKey::ProvisionTask => "groundwork.runlists.provision.task",
            EventKey::CleanupCacheEntries => "groundwork.cleanup.cache-entries",
            EventKey::Internal => "groundwork.internal",
            EventKey::TaskIo => "task.io",
        }
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution status of a provisioned command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    Cached,
    ExecStart,
    ExecFinished,
}

impl fmt::Display for ExecStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExecStatus::Cached => "CACHED",
            ExecStatus::ExecStart => "EXEC",
            ExecStatus::ExecFinished => "FINISHED",
        })
    }
}

/// One lifecycle message.
#[derive(Debug, Clone)]
pub struct Message {
    pub key: EventKey,
    /// Lifecycle state label: `started`, `finished`, `executed`,
    /// `panic`, `dryrun`, or the stream name for `task.io`.
    pub state: &'static str,
    pub hostname: String,
    pub task_name: String,
    pub fingerprint: Option<String>,
    /// Human-readable command description.
    pub message: Option<String>,
    pub stream: Option<&'static str>,
    pub line: Option<String>,
    pub exec_status: Option<ExecStatus>,
    pub started_at: DateTime<Utc>,
    pub total_runtime: Option<Duration>,
    pub error: Option<String>,
    pub stack: Option<String>,
    /// Cache entries that a dry run would invalidate.
    pub invalidated: Option<Vec<String>>,
}

impl Message {
    pub fn new(key: EventKey, hostname: impl Into<String>) -> Self {
        Self {
            key,
            state: "",
            hostname: hostname.into(),
            task_name: String::new(),
            fingerprint: None,
            message: None,
            stream: None,
            line: None,
            exec_status: None,
            started_at: Utc::now(),
            total_runtime: None,
            error: None,
            stack: None,
            invalidated: None,
        }
    }

    /// Clone of this message with the given lifecycle state.
    pub fn with_state(&self, state: &'static str) -> Message {
        let mut message = self.clone();
        message.state = state;
        message
    }

    /// Dotted key including the state suffix, e.g.
    /// `groundwork.runlists.provision.task.finished`.
    pub fn full_key(&self) -> String {
        if self.state.is_empty() {
            self.key.as_str().to_string()
        } else {
            format!("{}.{}", self.key, self.state)
        }
    }

    pub fn is_stderr(&self) -> bool {
        self.stream == Some("stderr")
    }
}

/// Handle to the in-process event channel. Cheap to clone; all clones
/// publish into the same channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Message>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    /// Create a bus whose subscribers buffer up to `capacity`
    /// messages before dropping the oldest.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish a message. Never blocks; with no subscribers the
    /// message is discarded.
    pub fn publish(&self, message: Message) {
        let _ = self.tx.send(message);
    }

    /// Register `handler` to be invoked per message on a background
    /// task. Close the returned [`Subscription`] to drain and learn
    /// whether messages were dropped.
    pub fn subscribe_fn<F>(&self, mut handler: F) -> Subscription
    where
        F: FnMut(&Message) + Send + 'static,
    {
        let mut rx = self.tx.subscribe();
        let ignored = Arc::new(AtomicU64::new(0));
        let shutdown = Arc::new(Notify::new());

        let task_ignored = Arc::clone(&ignored);
        let task_shutdown = Arc::clone(&shutdown);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_shutdown.notified() => {
                        // Drain whatever is still buffered, then stop.
                        loop {
                            match rx.try_recv() {
                                Ok(message) => handler(&message),
                                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                                    task_ignored.fetch_add(n, Ordering::SeqCst);
                                }
                                Err(_) => break,
                            }
                        }
                        break;
                    }
                    received = rx.recv() => match received {
                        Ok(message) => handler(&message),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            task_ignored.fetch_add(n, Ordering::SeqCst);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        Subscription {
            handle,
            ignored,
            shutdown,
        }
    }
}

/// A running subscriber. Must be closed to observe dropped-message
/// accounting.
pub struct Subscription {
    handle: JoinHandle<()>,
    ignored: Arc<AtomicU64>,
    shutdown: Arc<Notify>,
}

impl Subscription {
    /// Drain buffered messages, stop the subscriber task, and report
    /// [`Error::IgnoredMessages`] if any publication was dropped.
    pub async fn close(self) -> crate::Result<()> {
        self.shutdown.notify_one();
        let _ = self.handle.await;
        let count = self.ignored.load(Ordering::SeqCst);
        if count > 0 {
            return Err(Error::IgnoredMessages { count });
        }
        Ok(())
    }
}
