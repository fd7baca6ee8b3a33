use serde_json::Value;

use super::Command;
use crate::template;
use crate::validate::ValidationError;

/// Download an archive and extract it below a directory.
pub struct DownloadExtract {
    url: String,
    dest: String,
}

impl DownloadExtract {
    pub fn new(url: impl Into<String>, dest: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            dest: dest.into(),
        }
    }

    fn tar_flags(&self) -> &'static str {
        if self.url.ends_with(".tar.gz") || self.url.ends_with(".tgz") {
            "xzf"
        } else if self.url.ends_with(".tar.bz2") || self.url.ends_with(".tbz2") {
            "xjf"
        } else if self.url.ends_with(".tar.xz") {
            "xJf"
        } else {
            "xf"
        }
    }
}

impl Command for DownloadExtract {
    fn shell(&self) -> String {
        format!(
            "mkdir -p {dest} && curl -SsfL {url} | tar {flags} - -C {dest}",
            dest = self.dest,
            url = self.url,
            flags = self.tar_flags()
        )
    }

    fn log(&self) -> String {
        format!("[DWNLOAD] {} -> {}", self.url, self.dest)
    }

    fn render(&mut self, ctx: &Value) -> crate::Result<()> {
        self.url = template::render(&self.url, ctx)?;
        self.dest = template::render(&self.dest, ctx)?;
        Ok(())
    }

    fn validate(&self) -> crate::Result<()> {
        if self.url.is_empty() {
            return Err(ValidationError::Command("no url given".to_string()).into());
        }
        if self.dest.is_empty() {
            return Err(ValidationError::Command(format!(
                "no destination given for {:?}",
                self.url
            ))
            .into());
        }
        Ok(())
    }
}
