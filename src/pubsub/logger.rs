//! Terminal subscriber rendering lifecycle events as log lines.

use std::time::{Duration, Instant};

use colored::Colorize;

use super::{EventBus, EventKey, ExecStatus, Message, Subscription};

const MAX_PAYLOAD_LEN: usize = 90;

/// Subscribes to an [`EventBus`] and prints one line per relevant
/// message. Must be closed so dropped-message accounting is reported.
pub struct StdoutLogger {
    subscription: Subscription,
}

impl StdoutLogger {
    pub fn open(bus: &EventBus) -> Self {
        let started = Instant::now();
        let subscription = bus.subscribe_fn(move |message| {
            if let Some(line) = format_message(message, started.elapsed()) {
                println!("{line}");
            }
        });
        Self { subscription }
    }

    /// Returns [`crate::Error::IgnoredMessages`] if the logger fell
    /// behind and messages were dropped.
    pub async fn close(self) -> crate::Result<()> {
        self.subscription.close().await
    }
}

fn format_message(message: &Message, elapsed: Duration) -> Option<String> {
    match message.key {
        EventKey::ProvisionTask | EventKey::TaskIo => {}
        _ => return None,
    }

    let prefix = format!(
        "[{:>15}][{}][{}]",
        message.hostname,
        format_task_name(&message.task_name),
        format_duration(elapsed)
    );

    if let Some(line) = &message.line {
        let line = if message.is_stderr() {
            line.red().to_string()
        } else {
            line.clone()
        };
        return Some(format!("{prefix} {line}"));
    }

    // Command lifecycle line: only terminal states are interesting.
    let status = message.exec_status?;
    if message.state == "started" {
        return None;
    }
    let status_text = format!("{:<8}", status.to_string());
    let status_text = match status {
        ExecStatus::Cached => status_text.blue().to_string(),
        ExecStatus::ExecFinished if message.error.is_none() => status_text.green().to_string(),
        ExecStatus::ExecFinished => status_text.red().to_string(),
        ExecStatus::ExecStart => status_text.yellow().to_string(),
    };
    let payload = mid_trunc(message.message.as_deref().unwrap_or(""), MAX_PAYLOAD_LEN);
    Some(format!("{prefix}[{status_text}] {payload}"))
}

fn format_task_name(name: &str) -> String {
    format!("{:<8.8}", name)
}

fn format_duration(duration: Duration) -> String {
    if duration >= Duration::from_millis(1) {
        format!("{:7.3}", duration.as_secs_f64())
    } else {
        format!("{:7}", "")
    }
}

/// Shorten `input` to at most `len` characters by cutting out the
/// middle.
fn mid_trunc(input: &str, len: usize) -> String {
    let chars: Vec<char> = input.chars().collect();
    if chars.len() <= len || len < 4 {
        return input.to_string();
    }
    let keep = len - 3;
    let head = keep / 2 + keep % 2;
    let tail = keep / 2;
    let mut out: String = chars[..head].iter().collect();
    out.push_str("...");
    out.extend(&chars[chars.len() - tail..]);
    out
}
