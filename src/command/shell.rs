use serde_json::Value;

use super::Command;
use crate::template;
use crate::validate::ValidationError;

/// A literal shell string, optionally templated and optionally fed
/// bytes on stdin.
pub struct ShellCommand {
    cmd: String,
    stdin: Option<Vec<u8>>,
}

impl ShellCommand {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            stdin: None,
        }
    }

    /// Pipe `input` into the command's stdin when it runs.
    pub fn with_stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }
}

impl Command for ShellCommand {
    fn shell(&self) -> String {
        self.cmd.clone()
    }

    fn render(&mut self, ctx: &Value) -> crate::Result<()> {
        self.cmd = template::render(&self.cmd, ctx)?;
        Ok(())
    }

    fn validate(&self) -> crate::Result<()> {
        if self.cmd.trim().is_empty() {
            return Err(ValidationError::Command("empty shell command".to_string()).into());
        }
        Ok(())
    }

    fn stdin(&self) -> Option<Vec<u8>> {
        self.stdin.clone()
    }
}
