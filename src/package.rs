//! Packages: composable, ordered bundles of tasks.
//!
//! A package is built either directly (adding command lists under
//! task names) or from a [`Template`]: a configuration struct that
//! validates its fields and renders itself into tasks. Embedding a
//! template under a name prefixes every task it contributes, so the
//! same template can be provisioned twice under different names and
//! configurations without cache-key collisions.

use std::collections::HashSet;

use serde::Serialize;
use serde_json::Value;

use crate::command::Command;
use crate::error::Error;
use crate::pubsub::EventBus;
use crate::task::Task;
use crate::template::{self, RenderError};
use crate::validate::{validate_fields, FieldSpec};

/// Task-name prefix reserved for system-generated tasks.
pub const RESERVED_PREFIX: &str = "gw.";

/// A configuration struct that renders into tasks.
///
/// `fields()` describes the annotated fields for validation and
/// default application; the serialized struct is the context for
/// `{{ .Field }}` substitution in task names and command strings.
pub trait Template: Serialize {
    fn fields(&mut self) -> Vec<FieldSpec<'_>> {
        Vec::new()
    }

    fn render(&self, pkg: &mut Package) -> crate::Result<()>;
}

/// Validate a template's annotated fields, applying declared defaults
/// in place. Runs once per template per provisioning run.
pub fn validate_template<T: Template>(tpl: &mut T) -> crate::Result<()> {
    validate_fields(tpl.fields())?;
    Ok(())
}

/// An ordered collection of uniquely named tasks.
#[derive(Default, Debug)]
pub struct Package {
    tasks: Vec<Task>,
    task_names: HashSet<String>,
    reference: Option<Value>,
    cache_key_prefix: String,
}

impl Package {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `tpl`, apply its defaults, and render it into a
    /// package.
    pub fn from_template<T: Template>(tpl: &mut T) -> crate::Result<Package> {
        validate_template(tpl)?;
        let mut pkg = Package {
            reference: Some(reference_value(tpl)?),
            ..Package::default()
        };
        tpl.render(&mut pkg)?;
        Ok(pkg)
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub(crate) fn tasks_mut(&mut self) -> &mut [Task] {
        &mut self.tasks
    }

    /// Wrap `commands` in a new task registered under `name` (after
    /// prefix and template resolution).
    pub fn add_commands(
        &mut self,
        name: &str,
        commands: Vec<Box<dyn Command>>,
    ) -> crate::Result<()> {
        let name = self.scoped_name(name)?;
        let mut task = Task::with_reference(name, self.reference.clone());
        for command in commands {
            task.add_boxed(command);
        }
        self.insert_task(task)
    }

    /// Embed a sub-template: validate it, render it into a child
    /// package whose cache keys are prefixed with `name`, and move
    /// the resulting tasks into this package.
    pub fn add_template<T: Template>(&mut self, name: &str, tpl: &mut T) -> crate::Result<()> {
        let name = self.scoped_name(name)?;
        validate_template(tpl)?;
        let mut child = Package {
            reference: Some(reference_value(tpl)?),
            cache_key_prefix: name,
            ..Package::default()
        };
        tpl.render(&mut child)?;
        for task in child.tasks {
            self.insert_task(task)?;
        }
        Ok(())
    }

    /// Register an externally built task, prefixing its cache key.
    pub fn add_task(&mut self, mut task: Task) -> crate::Result<()> {
        let name = self.scoped_name(task.name())?;
        task.set_name(name);
        self.insert_task(task)
    }

    pub(crate) fn precompile(&mut self, bus: &EventBus) -> crate::Result<()> {
        for task in &mut self.tasks {
            task.compile(bus)?;
        }
        Ok(())
    }

    fn scoped_name(&self, name: &str) -> crate::Result<String> {
        if name.starts_with(RESERVED_PREFIX) {
            return Err(Error::ReservedTaskName(name.to_string()));
        }
        let scoped = if self.cache_key_prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", self.cache_key_prefix, name)
        };
        match (&self.reference, template::is_template(&scoped)) {
            (Some(reference), true) => Ok(template::render(&scoped, reference)?),
            _ => Ok(scoped),
        }
    }

    fn insert_task(&mut self, task: Task) -> crate::Result<()> {
        let name = task.name();
        if name.is_empty() {
            return Err(Error::EmptyTaskName);
        }
        if name.contains(char::is_whitespace) {
            return Err(Error::TaskNameWhitespace(name.to_string()));
        }
        if !self.task_names.insert(name.to_string()) {
            return Err(Error::DuplicateTask(name.to_string()));
        }
        self.tasks.push(task);
        Ok(())
    }
}

fn reference_value<T: Serialize>(tpl: &T) -> crate::Result<Value> {
    serde_json::to_value(tpl)
        .map_err(|e| Error::Template(RenderError::Context(e.to_string())))
}
