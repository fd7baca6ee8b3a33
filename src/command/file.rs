use std::io::Write;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::Command;
use crate::template;
use crate::validate::ValidationError;

const LOG_PREVIEW_LEN: usize = 50;

/// Write a file on the target.
///
/// The content travels gzip-compressed and base64-encoded inside the
/// shell string itself, is unpacked into a temporary file and moved
/// into place, so a partially transferred file never lands at the
/// final path.
pub struct WriteFile {
    path: String,
    content: String,
    owner: String,
    mode: Option<u32>,
}

impl WriteFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            owner: String::new(),
            mode: None,
        }
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// File permissions, e.g. `0o644`.
    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }
}

impl Command for WriteFile {
    fn shell(&self) -> String {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        // Writing into a Vec cannot fail.
        encoder.write_all(self.content.as_bytes()).expect("gzip to buffer");
        let zipped = encoder.finish().expect("gzip to buffer");
        let encoded = STANDARD.encode(zipped);

        let tmp_path = format!(
            "/tmp/groundwork.{:x}",
            Sha256::digest(self.content.as_bytes())
        );
        let dir = match self.path.rfind('/') {
            Some(0) => "/".to_string(),
            Some(idx) => self.path[..idx].to_string(),
            None => ".".to_string(),
        };

        let mut cmd = format!("mkdir -p {dir}");
        cmd += &format!(" && echo {encoded} | base64 -d | gunzip > {tmp_path}");
        if !self.owner.is_empty() {
            cmd += &format!(" && chown {} {}", self.owner, tmp_path);
        }
        if let Some(mode) = self.mode {
            cmd += &format!(" && chmod {:o} {}", mode, tmp_path);
        }
        cmd += &format!(" && mv {} {}", tmp_path, self.path);
        cmd
    }

    fn log(&self) -> String {
        let mut parts = vec!["[FILE   ]".to_string()];
        if !self.owner.is_empty() && self.owner != "root" {
            parts.push(format!("[CHOWN:{}]", self.owner));
        }
        if let Some(mode) = self.mode {
            parts.push(format!("[CHMOD:{:04o}]", mode));
        }
        parts.push(format!(" {}", self.path));
        let preview: String = self.content.chars().take(LOG_PREVIEW_LEN).collect();
        parts.push(format!(" << {}", preview.replace('\n', "\u{204b}")));
        parts.concat()
    }

    fn render(&mut self, ctx: &Value) -> crate::Result<()> {
        self.path = template::render(&self.path, ctx)?;
        self.content = template::render(&self.content, ctx)?;
        if !self.owner.is_empty() {
            self.owner = template::render(&self.owner, ctx)?;
        }
        Ok(())
    }

    fn validate(&self) -> crate::Result<()> {
        if self.path.is_empty() {
            return Err(ValidationError::Command("no path given for file".to_string()).into());
        }
        if self.content.is_empty() {
            return Err(ValidationError::Command(format!(
                "no content given for file {:?}",
                self.path
            ))
            .into());
        }
        Ok(())
    }
}
