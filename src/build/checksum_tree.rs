//! Parsing the remote marker scan into the in-memory cache tree.

use std::collections::{HashMap, HashSet};

use crate::checksum::FINGERPRINT_LEN;
use crate::error::Error;

/// Cache tree for one provisioning run: task name to the set of
/// fingerprints already completed on the target.
pub(crate) type ChecksumTree = HashMap<String, HashSet<String>>;

/// Parse the output of the `.done` marker scan below `root`. Each
/// line is `ROOT/<task>/<fingerprint>.done`; a fingerprint that is
/// not 64 characters poisons the cache.
pub(crate) fn parse(root: &str, output: &str) -> crate::Result<ChecksumTree> {
    let mut tree = ChecksumTree::new();
    let prefix = format!("{root}/");
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let rel = line.strip_prefix(&prefix).unwrap_or(line);
        let Some((task, file)) = rel.rsplit_once('/') else {
            continue;
        };
        let fingerprint = file.strip_suffix(".done").unwrap_or(file);
        if fingerprint.len() != FINGERPRINT_LEN {
            return Err(Error::CachePoisoned {
                task: task.to_string(),
                fingerprint: fingerprint.to_string(),
            });
        }
        tree.entry(task.to_string())
            .or_default()
            .insert(fingerprint.to_string());
    }
    Ok(tree)
}
