//! Action, task, and middleware registration
//!
//! The registry is built explicitly at boot and injected wherever lookups are
//! needed; there is no ambient global. [`RegistryBuilder`] collects
//! registrations and validates them eagerly — duplicate names and references
//! to unregistered formatter/validator functions are rejected at `build()`
//! time rather than at invocation time.

use std::collections::HashMap;
use std::sync::Arc;

use crate::action::{
    Action, ActionMiddleware, ApiVersion, FormatterFn, FormatterRef, InputSpec, ValidatorFn,
    ValidatorRef,
};
use crate::error::{Error, Result};
use crate::task::Task;

// ============================================================================
// Function Table
// ============================================================================

/// Load-time lookup table for formatters and validators registered by name
#[derive(Clone, Default)]
pub struct FunctionTable {
    formatters: HashMap<String, FormatterFn>,
    validators: HashMap<String, ValidatorFn>,
}

impl FunctionTable {
    /// Look up a formatter by name
    pub fn formatter(&self, name: &str) -> Option<&FormatterFn> {
        self.formatters.get(name)
    }

    /// Look up a validator by name
    pub fn validator(&self, name: &str) -> Option<&ValidatorFn> {
        self.validators.get(name)
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Collects registrations and produces a validated [`ApiRegistry`]
#[derive(Default)]
pub struct RegistryBuilder {
    actions: Vec<Arc<dyn Action>>,
    tasks: Vec<Arc<dyn Task>>,
    middleware: Vec<Arc<dyn ActionMiddleware>>,
    functions: FunctionTable,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action template
    pub fn register_action(mut self, action: Arc<dyn Action>) -> Self {
        self.actions.push(action);
        self
    }

    /// Register a task definition
    pub fn register_task(mut self, task: Arc<dyn Task>) -> Self {
        self.tasks.push(task);
        self
    }

    /// Register an action middleware
    pub fn register_middleware(mut self, middleware: Arc<dyn ActionMiddleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Register a formatter usable by name from input specs
    pub fn register_formatter(mut self, name: impl Into<String>, f: FormatterFn) -> Self {
        self.functions.formatters.insert(name.into(), f);
        self
    }

    /// Register a validator usable by name from input specs
    pub fn register_validator(mut self, name: impl Into<String>, f: ValidatorFn) -> Self {
        self.functions.validators.insert(name.into(), f);
        self
    }

    /// Validate all registrations and produce the immutable registry
    pub fn build(self) -> Result<ApiRegistry> {
        let mut actions: HashMap<String, Vec<Arc<dyn Action>>> = HashMap::new();

        for action in self.actions {
            let name = action.name().to_string();
            let versions = actions.entry(name.clone()).or_default();
            if versions.iter().any(|a| a.version() == action.version()) {
                return Err(Error::config(format!(
                    "duplicate action '{}' version '{}'",
                    name,
                    action.version()
                )));
            }
            check_named_functions(&name, &action.inputs(), &self.functions)?;
            versions.push(action);
        }

        // Versions sorted ascending so "latest" is the last element
        for versions in actions.values_mut() {
            versions.sort_by(|a, b| a.version().cmp(&b.version()));
        }

        let mut tasks: HashMap<String, Arc<dyn Task>> = HashMap::new();
        for task in self.tasks {
            let name = task.name().to_string();
            check_named_functions(&name, &task.inputs(), &self.functions)?;
            if tasks.insert(name.clone(), task).is_some() {
                return Err(Error::config(format!("duplicate task '{name}'")));
            }
        }

        let mut middleware = self.middleware;
        let mut seen = std::collections::HashSet::new();
        for mw in &middleware {
            if !seen.insert(mw.name().to_string()) {
                return Err(Error::config(format!(
                    "duplicate middleware '{}'",
                    mw.name()
                )));
            }
        }
        middleware.sort_by_key(|mw| mw.priority());

        Ok(ApiRegistry {
            actions,
            tasks,
            middleware,
            functions: self.functions,
        })
    }
}

/// Reject references to unregistered named formatters/validators, walking
/// nested schemas.
fn check_named_functions(
    owner: &str,
    inputs: &HashMap<String, InputSpec>,
    table: &FunctionTable,
) -> Result<()> {
    for (key, spec) in inputs {
        for formatter in &spec.formatters {
            if let FormatterRef::Named(name) = formatter {
                if table.formatter(name).is_none() {
                    return Err(Error::config(format!(
                        "'{owner}' input '{key}' references unknown formatter '{name}'"
                    )));
                }
            }
        }
        for validator in &spec.validators {
            if let ValidatorRef::Named(name) = validator {
                if table.validator(name).is_none() {
                    return Err(Error::config(format!(
                        "'{owner}' input '{key}' references unknown validator '{name}'"
                    )));
                }
            }
        }
        if let Some(schema) = &spec.schema {
            check_named_functions(owner, schema, table)?;
        }
    }
    Ok(())
}

// ============================================================================
// Registry
// ============================================================================

/// Immutable, process-wide registry of actions, tasks, and middleware
///
/// Read-only after boot; tests that need hot-swap rebuild it and replace the
/// server's handle.
pub struct ApiRegistry {
    actions: HashMap<String, Vec<Arc<dyn Action>>>,
    tasks: HashMap<String, Arc<dyn Task>>,
    middleware: Vec<Arc<dyn ActionMiddleware>>,
    functions: FunctionTable,
}

impl ApiRegistry {
    /// Resolve an action by name and (optional) version.
    ///
    /// With no version, the highest loaded version wins.
    pub fn action(&self, name: &str, version: Option<&ApiVersion>) -> Option<Arc<dyn Action>> {
        let versions = self.actions.get(name)?;
        match version {
            Some(wanted) => versions.iter().find(|a| a.version() == *wanted).cloned(),
            None => versions.last().cloned(),
        }
    }

    /// Whether any version of this action is loaded
    pub fn has_action(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// All loaded versions for a name, ascending
    pub fn action_versions(&self, name: &str) -> Vec<ApiVersion> {
        self.actions
            .get(name)
            .map(|versions| versions.iter().map(|a| a.version()).collect())
            .unwrap_or_default()
    }

    /// All loaded action names
    pub fn action_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.actions.keys().cloned().collect();
        names.sort();
        names
    }

    /// Look up a task definition
    pub fn task(&self, name: &str) -> Option<Arc<dyn Task>> {
        self.tasks.get(name).cloned()
    }

    /// All registered task definitions
    pub fn tasks(&self) -> impl Iterator<Item = &Arc<dyn Task>> {
        self.tasks.values()
    }

    /// Middleware applicable to an action: every global middleware plus the
    /// ones the action opted into, in ascending priority order.
    pub fn middleware_for(&self, opted_in: &[String]) -> Vec<Arc<dyn ActionMiddleware>> {
        self.middleware
            .iter()
            .filter(|mw| mw.global() || opted_in.iter().any(|name| name == mw.name()))
            .cloned()
            .collect()
    }

    /// The named formatter/validator lookup table
    pub fn functions(&self) -> &FunctionTable {
        &self.functions
    }
}
