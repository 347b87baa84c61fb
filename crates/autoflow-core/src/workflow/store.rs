//! Definition store consulted by the engine at execution time.
//!
//! Graphs are loaded once per process and shared read-only. `reload` swaps
//! the whole set atomically; a failed reload keeps serving the old graphs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use super::definition::{WorkflowError, WorkflowGraph, discover_definitions};

/// Read-only access to validated workflow definitions.
pub trait DefinitionStore: Send + Sync {
    /// Look up a definition by id.
    fn get(&self, definition_id: &str) -> Option<Arc<WorkflowGraph>>;

    /// All known definition ids, sorted.
    fn ids(&self) -> Vec<String>;
}

/// In-memory definition store, optionally backed by a directory of YAML files.
#[derive(Debug, Default)]
pub struct DefinitionCatalog {
    graphs: RwLock<HashMap<String, Arc<WorkflowGraph>>>,
    source: Option<PathBuf>,
}

impl DefinitionCatalog {
    /// Empty catalog with no backing directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog holding the given graphs.
    pub fn from_graphs(graphs: impl IntoIterator<Item = WorkflowGraph>) -> Self {
        let catalog = Self::new();
        for graph in graphs {
            catalog.insert(graph);
        }
        catalog
    }

    /// Load every definition under `dir`. A missing directory yields an empty
    /// catalog.
    pub fn load_dir(dir: &Path) -> Result<Self, WorkflowError> {
        let graphs = Self::read_dir(dir)?;
        tracing::info!(dir = %dir.display(), count = graphs.len(), "loaded workflow definitions");
        Ok(Self {
            graphs: RwLock::new(graphs),
            source: Some(dir.to_path_buf()),
        })
    }

    fn read_dir(dir: &Path) -> Result<HashMap<String, Arc<WorkflowGraph>>, WorkflowError> {
        Ok(discover_definitions(dir)?
            .into_iter()
            .map(|(_, graph)| (graph.id().to_string(), Arc::new(graph)))
            .collect())
    }

    /// Re-read the backing directory, replacing all graphs.
    ///
    /// Returns the number of definitions loaded. Catalogs without a backing
    /// directory are left untouched.
    pub fn reload(&self) -> Result<usize, WorkflowError> {
        let Some(dir) = &self.source else {
            return Ok(self.len());
        };
        let fresh = Self::read_dir(dir)?;
        let count = fresh.len();
        *self.write_guard() = fresh;
        tracing::info!(dir = %dir.display(), count, "reloaded workflow definitions");
        Ok(count)
    }

    /// Insert or replace a single graph.
    pub fn insert(&self, graph: WorkflowGraph) -> Option<Arc<WorkflowGraph>> {
        self.write_guard()
            .insert(graph.id().to_string(), Arc::new(graph))
    }

    /// Remove a graph by id.
    pub fn remove(&self, definition_id: &str) -> Option<Arc<WorkflowGraph>> {
        self.write_guard().remove(definition_id)
    }

    pub fn len(&self) -> usize {
        self.read_guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    // Writers only swap whole entries, so a poisoned lock still guards a
    // consistent map.
    fn read_guard(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<WorkflowGraph>>> {
        self.graphs.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_guard(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<WorkflowGraph>>> {
        self.graphs.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl DefinitionStore for DefinitionCatalog {
    fn get(&self, definition_id: &str) -> Option<Arc<WorkflowGraph>> {
        self.read_guard().get(definition_id).cloned()
    }

    fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read_guard().keys().cloned().collect();
        ids.sort();
        ids
    }
}
