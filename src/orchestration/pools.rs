//! Status pools: an O(1) index from status to the set of task ids in it.
//!
//! The orchestrator keeps the pools in lockstep with task statuses; every
//! task is in exactly one pool at any observation point.

use std::collections::{HashMap, HashSet};

use crate::core::graph::Graph;
use crate::core::task::{TaskId, TaskStatus};
use crate::error::{Error, Result};

/// Index of task ids by status.
#[derive(Debug, Clone)]
pub struct PoolManager {
    pools: HashMap<TaskStatus, HashSet<TaskId>>,
}

impl PoolManager {
    /// Create empty pools for every status.
    pub fn new() -> Self {
        let pools = TaskStatus::ALL
            .iter()
            .map(|s| (*s, HashSet::new()))
            .collect();
        Self { pools }
    }

    /// Rebuild the index from a graph, discarding previous contents.
    pub fn initialize_from_graph(&mut self, graph: &Graph) {
        for pool in self.pools.values_mut() {
            pool.clear();
        }
        for task in graph.tasks() {
            self.insert(task.id, task.status);
        }
    }

    fn insert(&mut self, id: TaskId, status: TaskStatus) {
        if let Some(pool) = self.pools.get_mut(&status) {
            pool.insert(id);
        }
    }

    /// Move a task between pools.
    ///
    /// Errors if the task is not currently in `from`; the pools are left
    /// unchanged in that case.
    pub fn move_task(&mut self, id: TaskId, from: TaskStatus, to: TaskStatus) -> Result<()> {
        let present = self
            .pools
            .get(&from)
            .map(|p| p.contains(&id))
            .unwrap_or(false);
        if !present {
            return Err(Error::PoolInconsistency { task: id, pool: from });
        }
        if let Some(pool) = self.pools.get_mut(&from) {
            pool.remove(&id);
        }
        self.insert(id, to);
        Ok(())
    }

    /// The set of task ids in a status pool.
    pub fn pool(&self, status: TaskStatus) -> &HashSet<TaskId> {
        // new() seeds every status, so the lookup cannot miss
        &self.pools[&status]
    }

    /// Which pool a task is in, if any.
    pub fn status_of(&self, id: &TaskId) -> Option<TaskStatus> {
        self.pools
            .iter()
            .find(|(_, pool)| pool.contains(id))
            .map(|(status, _)| *status)
    }

    /// Per-status sizes.
    pub fn counts(&self) -> HashMap<TaskStatus, usize> {
        self.pools.iter().map(|(s, p)| (*s, p.len())).collect()
    }

    /// Total number of indexed tasks.
    pub fn len(&self) -> usize {
        self.pools.values().map(|p| p.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PoolManager {
    fn default() -> Self {
        Self::new()
    }
}
