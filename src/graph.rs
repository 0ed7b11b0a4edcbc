//! Compact dependency graph in CSR form.
//!
//! Modules are indexed in insertion order; an edge `u → v` means *v depends
//! on u*, so relaxing the outgoing edges of a finished module walks exactly
//! the modules waiting on it. The graph is built once per topology and
//! cached by the workflow until a mutator invalidates it.

use rustc_hash::FxHashMap;
use std::sync::Arc;

use crate::error::WorkflowError;
use crate::workflow::ModuleEntry;

#[derive(Debug, Clone)]
pub(crate) struct DepGraph {
    pub(crate) node_count: usize,
    /// In-degree per module; copied into per-run scratch by the scheduler.
    pub(crate) indeg: Vec<usize>,
    /// CSR offsets, `node_count + 1` entries.
    offsets: Vec<usize>,
    /// CSR adjacency: indices of dependents.
    targets: Vec<usize>,
}

impl DepGraph {
    /// Build the CSR graph from the registered modules. Every declared
    /// dependency must be registered, else `MissingDependency`.
    pub(crate) fn build(
        entries: &[ModuleEntry],
        index: &FxHashMap<Arc<str>, usize>,
    ) -> Result<Self, WorkflowError> {
        let n = entries.len();
        let mut indeg = vec![0usize; n];
        let mut outdeg = vec![0usize; n];

        for (u, entry) in entries.iter().enumerate() {
            for dep in &entry.deps {
                let &v = index.get(dep.as_ref()).ok_or_else(|| {
                    WorkflowError::MissingDependency {
                        module: entry.name.to_string(),
                        dependency: dep.to_string(),
                    }
                })?;
                indeg[u] += 1;
                outdeg[v] += 1;
            }
        }

        let mut offsets = vec![0usize; n + 1];
        for i in 0..n {
            offsets[i + 1] = offsets[i] + outdeg[i];
        }

        // Reuse outdeg as the per-node write cursor.
        let mut cursor = offsets.clone();
        let mut targets = vec![0usize; offsets[n]];
        for (u, entry) in entries.iter().enumerate() {
            for dep in &entry.deps {
                let v = index[dep.as_ref()];
                targets[cursor[v]] = u;
                cursor[v] += 1;
            }
        }

        Ok(Self {
            node_count: n,
            indeg,
            offsets,
            targets,
        })
    }

    /// Indices of the modules depending on `u`.
    pub(crate) fn dependents(&self, u: usize) -> &[usize] {
        &self.targets[self.offsets[u]..self.offsets[u + 1]]
    }
}
