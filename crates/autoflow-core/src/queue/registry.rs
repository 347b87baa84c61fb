//! Job registry for runtime handler lookup.
//!
//! A name-indexed registry of boxed job handlers, built once at process start.
//!
//! Coordinator bindings (the fork join) spend their run waiting on other
//! jobs. Workers run them outside the bounded job slots and without the
//! per-job timeout; the handler enforces its own deadline.

use std::collections::{HashMap, HashSet};

use super::handler::{BoxJobHandler, JobHandler};
use crate::workflow::definition::WorkflowGraph;

/// Registry of job handlers, indexed by binding name.
#[derive(Debug, Clone)]
pub struct JobRegistry {
    handlers: HashMap<String, BoxJobHandler>,
    coordinators: HashSet<String>,
}

impl JobRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            coordinators: HashSet::new(),
        }
    }

    /// Register a handler under the given binding name.
    ///
    /// If a handler with this name already exists, it is replaced.
    pub fn register<T: JobHandler + 'static>(&mut self, name: impl Into<String>, handler: T) {
        let name = name.into();
        self.coordinators.remove(&name);
        self.handlers.insert(name, BoxJobHandler::new(handler));
    }

    /// Register a handler that blocks on other jobs (see module docs).
    pub fn register_coordinator<T: JobHandler + 'static>(
        &mut self,
        name: impl Into<String>,
        handler: T,
    ) {
        let name = name.into();
        self.handlers.insert(name.clone(), BoxJobHandler::new(handler));
        self.coordinators.insert(name);
    }

    pub fn is_coordinator(&self, name: &str) -> bool {
        self.coordinators.contains(name)
    }

    /// Look up a handler by binding name.
    pub fn get(&self, name: &str) -> Option<&BoxJobHandler> {
        self.handlers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// List all registered binding names, sorted.
    pub fn list_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Registered bindings split into `(ordinary, coordinators)`, sorted.
    pub fn partition_bindings(&self) -> (Vec<String>, Vec<String>) {
        self.list_names()
            .into_iter()
            .map(str::to_string)
            .partition(|name| !self.is_coordinator(name))
    }

    /// Job bindings of a definition that have no handler here.
    pub fn missing_bindings<'a>(&self, graph: &'a WorkflowGraph) -> Vec<&'a str> {
        graph
            .job_bindings()
            .into_iter()
            .filter(|binding| !self.contains(binding))
            .collect()
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}
