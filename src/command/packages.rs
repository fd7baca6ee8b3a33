use serde_json::Value;

use super::Command;
use crate::template;
use crate::validate::ValidationError;

/// Install OS packages through the system package manager,
/// non-interactively.
pub struct InstallPackages {
    packages: Vec<String>,
}

impl InstallPackages {
    pub fn new<I, S>(packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            packages: packages.into_iter().map(Into::into).collect(),
        }
    }
}

impl Command for InstallPackages {
    fn shell(&self) -> String {
        format!(
            "DEBIAN_FRONTEND=noninteractive apt-get install -y {}",
            self.packages.join(" ")
        )
    }

    fn log(&self) -> String {
        format!("[PACKAGE] {}", self.packages.join(" "))
    }

    fn render(&mut self, ctx: &Value) -> crate::Result<()> {
        for package in &mut self.packages {
            *package = template::render(package, ctx)?;
        }
        Ok(())
    }

    fn validate(&self) -> crate::Result<()> {
        if self.packages.is_empty() {
            return Err(ValidationError::Command("no packages given".to_string()).into());
        }
        if let Some(empty) = self.packages.iter().find(|p| p.trim().is_empty()) {
            return Err(ValidationError::Command(format!(
                "empty package name {empty:?}"
            ))
            .into());
        }
        Ok(())
    }
}
