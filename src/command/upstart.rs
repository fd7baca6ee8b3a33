use serde_json::Value;

use super::{Command, WriteFile};
use crate::template;
use crate::validate::ValidationError;

/// Register an upstart unit: a service definition written to
/// `/etc/init/<name>.conf` and started on the standard runlevels.
pub struct UpstartService {
    name: String,
    exec: String,
    description: String,
    respawn: bool,
}

impl UpstartService {
    pub fn new(name: impl Into<String>, exec: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exec: exec.into(),
            description: String::new(),
            respawn: true,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn respawn(mut self, respawn: bool) -> Self {
        self.respawn = respawn;
        self
    }

    fn unit(&self) -> String {
        let description = if self.description.is_empty() {
            &self.name
        } else {
            &self.description
        };
        let mut conf = format!(
            "description \"{description}\"\n\nstart on runlevel [2345]\nstop on runlevel [!2345]\n\n"
        );
        if self.respawn {
            conf += "respawn\n";
        }
        conf += &format!("exec {}\n", self.exec);
        conf
    }

    fn file_command(&self) -> WriteFile {
        WriteFile::new(format!("/etc/init/{}.conf", self.name), self.unit()).mode(0o644)
    }
}

impl Command for UpstartService {
    fn shell(&self) -> String {
        self.file_command().shell()
    }

    fn log(&self) -> String {
        format!("[UPSTART] adding service {:?}", self.name)
    }

    fn render(&mut self, ctx: &Value) -> crate::Result<()> {
        self.name = template::render(&self.name, ctx)?;
        self.exec = template::render(&self.exec, ctx)?;
        if !self.description.is_empty() {
            self.description = template::render(&self.description, ctx)?;
        }
        Ok(())
    }

    fn validate(&self) -> crate::Result<()> {
        if self.name.is_empty() || self.name.contains(char::is_whitespace) {
            return Err(ValidationError::Command(format!(
                "invalid upstart service name {:?}",
                self.name
            ))
            .into());
        }
        if self.exec.is_empty() {
            return Err(ValidationError::Command(format!(
                "no exec given for upstart service {:?}",
                self.name
            ))
            .into());
        }
        Ok(())
    }
}
