//! End-to-end provisioning runs against a local shell target.
//!
//! Each test provisions into a fresh temporary cache root with group
//! management disabled, then asserts on the published events and the
//! marker files left on disk.

use std::path::Path;
use std::sync::{Arc, Mutex};

use groundwork::command::{shell, Command};
use groundwork::pubsub::{EventKey, ExecStatus, Message};
use groundwork::validate::{FieldSpec, FieldValue};
use groundwork::{Build, Error, EventBus, LocalTarget, Package, Template};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

async fn run_build(root: &str, pkg: &mut Package) -> (groundwork::Result<()>, Vec<Message>) {
    let bus = EventBus::new(8192);
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let subscription = bus.subscribe_fn(move |message| sink.lock().unwrap().push(message.clone()));

    let build = Build::new(Arc::new(LocalTarget::new()))
        .cache_root(root)
        .group(None)
        .bus(bus.clone());
    let result = build.run(pkg).await;

    subscription.close().await.unwrap();
    let events = events.lock().unwrap().clone();
    (result, events)
}

fn base_package(commands: &[&str]) -> Package {
    let mut pkg = Package::new();
    pkg.add_commands("base", commands.iter().map(|c| shell(*c)).collect())
        .unwrap();
    pkg
}

/// Rolling fingerprints over a command sequence: entry `i` hashes the
/// concatenation of commands `0..=i`.
fn chained_fingerprints(commands: &[&str]) -> Vec<String> {
    let mut concatenated = String::new();
    commands
        .iter()
        .map(|command| {
            concatenated.push_str(command);
            format!("{:x}", Sha256::digest(concatenated.as_bytes()))
        })
        .collect()
}

fn files_with_suffix(dir: &Path, suffix: &str) -> Vec<String> {
    let mut names: Vec<String> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .filter(|name| name.ends_with(suffix))
            .collect(),
        Err(_) => Vec::new(),
    };
    names.sort();
    names
}

fn done_files(fingerprints: &[&String]) -> Vec<String> {
    let mut names: Vec<String> = fingerprints
        .iter()
        .map(|fp| format!("{fp}.done"))
        .collect();
    names.sort();
    names
}

fn command_events<'a>(events: &'a [Message], status: ExecStatus, state: &str) -> Vec<&'a Message> {
    events
        .iter()
        .filter(|m| {
            m.key == EventKey::ProvisionTask && m.exec_status == Some(status) && m.state == state
        })
        .collect()
}

#[tokio::test]
async fn empty_package_only_prepares_the_cache_root() {
    let root = TempDir::new().unwrap();
    let root_path = root.path().join("cache");
    let mut pkg = Package::new();

    let (result, events) = run_build(root_path.to_str().unwrap(), &mut pkg).await;

    result.unwrap();
    assert!(root_path.is_dir());
    assert!(events.iter().all(|m| m.key != EventKey::ProvisionTask));
    assert!(events.iter().all(|m| m.key != EventKey::TaskIo));
}

#[tokio::test]
async fn fresh_host_executes_every_command_and_leaves_markers() {
    let root = TempDir::new().unwrap();
    let root_str = root.path().to_str().unwrap();
    let commands = ["echo step-one", "echo step-two"];
    let fingerprints = chained_fingerprints(&commands);

    let (result, events) = run_build(root_str, &mut base_package(&commands)).await;
    result.unwrap();

    let task_dir = root.path().join("base");
    assert_eq!(
        files_with_suffix(&task_dir, ".done"),
        done_files(&[&fingerprints[0], &fingerprints[1]])
    );

    assert_eq!(
        command_events(&events, ExecStatus::ExecStart, "started").len(),
        2
    );
    assert_eq!(
        command_events(&events, ExecStatus::ExecFinished, "finished").len(),
        2
    );
    assert!(command_events(&events, ExecStatus::Cached, "finished").is_empty());

    // Captured output landed in the per-command log file.
    let log = std::fs::read_to_string(task_dir.join(format!("{}.log", fingerprints[0]))).unwrap();
    assert!(log.contains("\tstdout\tstep-one"));

    // One run manifest naming both markers.
    let manifests = files_with_suffix(&task_dir, ".run");
    assert_eq!(manifests.len(), 1);
    let manifest = std::fs::read_to_string(task_dir.join(&manifests[0])).unwrap();
    assert_eq!(manifest.lines().count(), 2);
}

#[tokio::test]
async fn unchanged_rerun_executes_nothing() {
    let root = TempDir::new().unwrap();
    let root_str = root.path().to_str().unwrap();
    let commands = ["echo step-one", "echo step-two"];

    let (first, _) = run_build(root_str, &mut base_package(&commands)).await;
    first.unwrap();
    let task_dir = root.path().join("base");
    let markers_before = files_with_suffix(&task_dir, ".done");

    let (second, events) = run_build(root_str, &mut base_package(&commands)).await;
    second.unwrap();

    assert!(command_events(&events, ExecStatus::ExecStart, "started").is_empty());
    assert_eq!(command_events(&events, ExecStatus::Cached, "finished").len(), 2);
    assert!(events.iter().all(|m| m.key != EventKey::TaskIo));
    assert_eq!(files_with_suffix(&task_dir, ".done"), markers_before);
}

#[tokio::test]
async fn editing_the_second_command_invalidates_only_its_marker() {
    let root = TempDir::new().unwrap();
    let root_str = root.path().to_str().unwrap();
    let original = ["echo step-one", "echo step-two"];
    let edited = ["echo step-one", "echo step-two-changed"];

    let (first, _) = run_build(root_str, &mut base_package(&original)).await;
    first.unwrap();

    let (second, events) = run_build(root_str, &mut base_package(&edited)).await;
    second.unwrap();

    assert_eq!(command_events(&events, ExecStatus::Cached, "finished").len(), 1);
    assert_eq!(
        command_events(&events, ExecStatus::ExecStart, "started").len(),
        1
    );

    let old = chained_fingerprints(&original);
    let new = chained_fingerprints(&edited);
    assert_eq!(old[0], new[0]);
    let task_dir = root.path().join("base");
    assert_eq!(
        files_with_suffix(&task_dir, ".done"),
        done_files(&[&new[0], &new[1]])
    );
    assert!(!task_dir.join(format!("{}.done", old[1])).exists());
}

#[tokio::test]
async fn inserting_a_command_reruns_the_tail() {
    let root = TempDir::new().unwrap();
    let root_str = root.path().to_str().unwrap();
    let original = ["echo step-one", "echo step-two"];
    let extended = ["echo step-one", "echo inserted", "echo step-two"];

    let (first, _) = run_build(root_str, &mut base_package(&original)).await;
    first.unwrap();

    let (second, events) = run_build(root_str, &mut base_package(&extended)).await;
    second.unwrap();

    assert_eq!(command_events(&events, ExecStatus::Cached, "finished").len(), 1);
    assert_eq!(
        command_events(&events, ExecStatus::ExecStart, "started").len(),
        2
    );

    let old = chained_fingerprints(&original);
    let new = chained_fingerprints(&extended);
    let task_dir = root.path().join("base");
    assert_eq!(
        files_with_suffix(&task_dir, ".done"),
        done_files(&[&new[0], &new[1], &new[2]])
    );
    assert!(!task_dir.join(format!("{}.done", old[1])).exists());
}

#[tokio::test]
async fn a_failing_command_aborts_the_run_and_leaves_a_failed_marker() {
    let root = TempDir::new().unwrap();
    let root_str = root.path().to_str().unwrap();
    let commands = ["true", "false", "echo unreachable"];
    let fingerprints = chained_fingerprints(&commands);

    let (result, events) = run_build(root_str, &mut base_package(&commands)).await;
    match result.unwrap_err() {
        Error::CommandFailed { status, .. } => assert_eq!(status.code(), Some(1)),
        other => panic!("expected CommandFailed, got {other:?}"),
    }

    let task_dir = root.path().join("base");
    assert!(task_dir.join(format!("{}.done", fingerprints[0])).exists());
    assert!(task_dir.join(format!("{}.failed", fingerprints[1])).exists());
    assert!(!task_dir.join(format!("{}.done", fingerprints[2])).exists());
    assert!(!task_dir.join(format!("{}.failed", fingerprints[2])).exists());

    // The failed marker carries the script that failed.
    let script =
        std::fs::read_to_string(task_dir.join(format!("{}.failed", fingerprints[1]))).unwrap();
    assert!(script.contains("#!/bin/sh"));
    assert!(script.contains("false"));

    // The third command never started.
    assert_eq!(
        command_events(&events, ExecStatus::ExecStart, "started").len(),
        2
    );
    let failed = command_events(&events, ExecStatus::ExecFinished, "finished");
    assert!(failed.last().unwrap().error.is_some());
}

#[derive(Serialize)]
struct AppConfig {
    #[serde(rename = "Version")]
    version: String,
}

impl Template for AppConfig {
    fn fields(&mut self) -> Vec<FieldSpec<'_>> {
        vec![FieldSpec::new(
            "Version",
            "required=true",
            FieldValue::String(&mut self.version),
        )]
    }

    fn render(&self, pkg: &mut Package) -> groundwork::Result<()> {
        pkg.add_commands("install", vec![shell("echo installing {{ .Version }}")])
    }
}

#[tokio::test]
async fn invalid_config_is_rejected_before_any_remote_action() {
    let root = TempDir::new().unwrap();
    let root_path = root.path().join("cache");

    let mut cfg = AppConfig {
        version: String::new(),
    };
    match Package::from_template(&mut cfg) {
        Err(Error::ConfigInvalid(_)) => {}
        other => panic!("expected ConfigInvalid, got {other:?}"),
    }

    // Nothing was provisioned, nothing touched the filesystem.
    assert!(!root_path.exists());
}

#[tokio::test]
async fn valid_config_provisions_rendered_commands() {
    let root = TempDir::new().unwrap();
    let root_str = root.path().to_str().unwrap();

    let mut cfg = AppConfig {
        version: "1.2.3".to_string(),
    };
    let mut pkg = Package::from_template(&mut cfg).unwrap();
    let (result, events) = run_build(root_str, &mut pkg).await;
    result.unwrap();

    let io_lines: Vec<&Message> = events
        .iter()
        .filter(|m| m.key == EventKey::TaskIo && m.stream == Some("stdout"))
        .collect();
    assert!(io_lines
        .iter()
        .any(|m| m.line.as_deref() == Some("installing 1.2.3")));
}

#[tokio::test]
async fn dry_run_reports_but_does_not_execute() {
    let root = TempDir::new().unwrap();
    let root_str = root.path().to_str().unwrap();
    let commands = ["echo step-one", "echo step-two"];

    let bus = EventBus::new(8192);
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let subscription = bus.subscribe_fn(move |m| sink.lock().unwrap().push(m.clone()));

    let build = Build::new(Arc::new(LocalTarget::new()))
        .cache_root(root_str)
        .group(None)
        .dry_run(true)
        .bus(bus.clone());
    build.run(&mut base_package(&commands)).await.unwrap();
    subscription.close().await.unwrap();

    let events = events.lock().unwrap().clone();
    let executed: Vec<&Message> = events
        .iter()
        .filter(|m| m.key == EventKey::ProvisionTask && m.state == "executed")
        .collect();
    assert_eq!(executed.len(), 2);
    assert!(files_with_suffix(&root.path().join("base"), ".done").is_empty());
}

struct PinnedCommand;

impl Command for PinnedCommand {
    fn shell(&self) -> String {
        "echo pinned".to_string()
    }

    fn checksum(&self) -> Option<String> {
        Some("a".repeat(64))
    }
}

#[tokio::test]
async fn checksum_overrides_name_the_marker_but_keep_the_chain_intact() {
    let root = TempDir::new().unwrap();
    let root_str = root.path().to_str().unwrap();

    let mut pkg = Package::new();
    pkg.add_commands(
        "base",
        vec![Box::new(PinnedCommand), shell("echo follower")],
    )
    .unwrap();
    let (result, _) = run_build(root_str, &mut pkg).await;
    result.unwrap();

    let task_dir = root.path().join("base");
    assert!(task_dir.join(format!("{}.done", "a".repeat(64))).exists());

    // The follower's fingerprint still chains over the overridden
    // command's shell string.
    let chained = chained_fingerprints(&["echo pinned", "echo follower"]);
    assert!(task_dir.join(format!("{}.done", chained[1])).exists());
}

#[tokio::test]
async fn malformed_markers_poison_the_cache() {
    let root = TempDir::new().unwrap();
    let root_str = root.path().to_str().unwrap();
    let task_dir = root.path().join("base");
    std::fs::create_dir_all(&task_dir).unwrap();
    std::fs::write(task_dir.join("deadbeef.done"), "").unwrap();

    let (result, _) = run_build(root_str, &mut base_package(&["true"])).await;
    match result.unwrap_err() {
        Error::CachePoisoned { task, fingerprint } => {
            assert_eq!(task, "base");
            assert_eq!(fingerprint, "deadbeef");
        }
        other => panic!("expected CachePoisoned, got {other:?}"),
    }
}

#[tokio::test]
async fn markers_of_unknown_tasks_are_left_untouched() {
    let root = TempDir::new().unwrap();
    let root_str = root.path().to_str().unwrap();
    let stale_dir = root.path().join("retired-task");
    std::fs::create_dir_all(&stale_dir).unwrap();
    let stale_marker = stale_dir.join(format!("{}.done", "b".repeat(64)));
    std::fs::write(&stale_marker, "").unwrap();

    let (result, _) = run_build(root_str, &mut base_package(&["true"])).await;
    result.unwrap();

    assert!(stale_marker.exists());
}

#[tokio::test]
async fn stdin_commands_receive_their_input() {
    use groundwork::command::ShellCommand;

    let root = TempDir::new().unwrap();
    let root_str = root.path().to_str().unwrap();

    let mut pkg = Package::new();
    pkg.add_commands(
        "base",
        vec![Box::new(
            ShellCommand::new("cat - | tr a-z A-Z").with_stdin("shout"),
        )],
    )
    .unwrap();
    let (result, events) = run_build(root_str, &mut pkg).await;
    result.unwrap();

    assert!(events
        .iter()
        .filter(|m| m.key == EventKey::TaskIo)
        .any(|m| m.line.as_deref() == Some("SHOUT")));
}
