//! Tasks: named, ordered command lists sharing one cache namespace.

use std::panic::{catch_unwind, AssertUnwindSafe};

use serde_json::Value;

use crate::command::{Command, ShellCommand};
use crate::error::Error;
use crate::pubsub::{EventBus, EventKey, Message};

/// An ordered list of commands under a unique name. The name is the
/// cache key on the target: markers for this task's commands live in
/// its directory under the cache root.
///
/// Commands may only be added before compilation; [`Task::compile`]
/// renders and validates every command against the configuration
/// reference and freezes the list.
pub struct Task {
    name: String,
    commands: Vec<Box<dyn Command>>,
    reference: Option<Value>,
    compiled: bool,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("commands", &self.commands.len())
            .field("compiled", &self.compiled)
            .finish()
    }
}

impl Task {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_reference(name, None)
    }

    pub(crate) fn with_reference(name: impl Into<String>, reference: Option<Value>) -> Self {
        Self {
            name: name.into(),
            commands: Vec::new(),
            reference,
            compiled: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_name(&mut self, name: String) {
        self.name = name;
    }

    /// Append a command.
    ///
    /// # Panics
    ///
    /// Panics when called after [`Task::compile`]: the command list
    /// is frozen once fingerprints can have been derived from it.
    pub fn add<C: Command + 'static>(&mut self, command: C) -> &mut Self {
        self.add_boxed(Box::new(command))
    }

    /// Append a raw shell string, promoted to a [`ShellCommand`].
    pub fn add_shell(&mut self, command: impl Into<String>) -> &mut Self {
        self.add_boxed(Box::new(ShellCommand::new(command)))
    }

    pub(crate) fn add_boxed(&mut self, command: Box<dyn Command>) -> &mut Self {
        if self.compiled {
            panic!("task {:?} is already compiled", self.name);
        }
        self.commands.push(command);
        self
    }

    /// The commands of this task, compiling first if necessary.
    pub fn commands(&mut self, bus: &EventBus) -> crate::Result<&[Box<dyn Command>]> {
        self.compile(bus)?;
        Ok(&self.commands)
    }

    /// Render and validate every command against the configuration
    /// reference. Publishes `…runlists.precompile` lifecycle events;
    /// a panic out of command code is caught, published under the
    /// `panic` state with a captured backtrace, and returned as an
    /// error. Repeated calls are no-ops.
    pub fn compile(&mut self, bus: &EventBus) -> crate::Result<()> {
        if self.compiled {
            return Ok(());
        }
        let mut message = Message::new(EventKey::Precompile, "");
        message.task_name = self.name.clone();
        bus.publish(message.with_state("started"));

        match catch_unwind(AssertUnwindSafe(|| self.compile_commands())) {
            Ok(Ok(())) => {
                bus.publish(message.with_state("finished"));
                self.compiled = true;
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                let error = Error::Precompile {
                    task: self.name.clone(),
                    message: reason,
                };
                message.error = Some(error.to_string());
                message.stack = Some(std::backtrace::Backtrace::force_capture().to_string());
                bus.publish(message.with_state("panic"));
                Err(error)
            }
        }
    }

    fn compile_commands(&mut self) -> crate::Result<()> {
        if let Some(reference) = &self.reference {
            for command in &mut self.commands {
                command.render(reference)?;
                command.validate()?;
            }
        }
        Ok(())
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
