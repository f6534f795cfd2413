//! Dependency graph over tasks.
//!
//! The graph owns the tasks and their dependency connections. Tasks live in
//! a `BTreeMap` so serialization is deterministic and lossless; a petgraph
//! `DiGraph` is rebuilt on demand for the cycle probe and the topological
//! ordering.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};

use crate::core::task::{StateChange, Task, TaskEvent, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::clog_debug;

/// A dependency edge: `to` depends on `from`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub from: TaskId,
    pub to: TaskId,
}

/// Result of a topological ordering attempt.
///
/// Never an error: when the graph has a cycle, `order` holds the tasks that
/// could be ordered and `cycle` holds every task involved in (or downstream
/// of) the cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct TopoOrder {
    pub order: Vec<TaskId>,
    pub cycle: Vec<TaskId>,
}

impl TopoOrder {
    pub fn has_cycle(&self) -> bool {
        !self.cycle.is_empty()
    }
}

/// The task dependency graph for one feature.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    tasks: BTreeMap<TaskId, Task>,
    connections: Vec<Connection>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task, returning its id.
    pub fn add_task(&mut self, task: Task) -> TaskId {
        let id = task.id;
        self.tasks.insert(id, task);
        id
    }

    /// Add a dependency: `to` depends on `from`.
    ///
    /// Rejects unknown endpoints, self-dependencies, and edges that would
    /// create a cycle. On rejection the graph is unchanged.
    pub fn add_connection(&mut self, from: TaskId, to: TaskId) -> Result<()> {
        if !self.tasks.contains_key(&from) {
            return Err(Error::TaskNotFound(from));
        }
        if !self.tasks.contains_key(&to) {
            return Err(Error::TaskNotFound(to));
        }
        if from == to {
            return Err(Error::Validation(format!(
                "task {} cannot depend on itself",
                from.short()
            )));
        }
        let connection = Connection { from, to };
        if self.connections.contains(&connection) {
            return Ok(());
        }

        self.connections.push(connection);
        let (pg, _) = self.build_petgraph();
        if is_cyclic_directed(&pg) {
            self.connections.pop();
            clog_debug!(
                "Rejected edge {} -> {}: would create a cycle",
                from.short(),
                to.short()
            );
            return Err(Error::CycleDetected {
                tasks: vec![from, to],
            });
        }
        Ok(())
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn task_ids(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.tasks.keys().copied()
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks that `id` depends on.
    pub fn dependencies_of(&self, id: &TaskId) -> Vec<TaskId> {
        self.connections
            .iter()
            .filter(|c| c.to == *id)
            .map(|c| c.from)
            .collect()
    }

    /// Tasks that depend on `id`.
    pub fn dependents_of(&self, id: &TaskId) -> Vec<TaskId> {
        self.connections
            .iter()
            .filter(|c| c.from == *id)
            .map(|c| c.to)
            .collect()
    }

    /// Are all of `id`'s dependencies done?
    pub fn dependencies_satisfied(&self, id: &TaskId) -> bool {
        self.dependencies_of(id)
            .iter()
            .all(|dep| matches!(self.tasks.get(dep).map(|t| t.status), Some(TaskStatus::Done)))
    }

    fn build_petgraph(&self) -> (DiGraph<TaskId, ()>, HashMap<TaskId, NodeIndex>) {
        let mut pg = DiGraph::new();
        let mut index = HashMap::new();
        for id in self.tasks.keys() {
            index.insert(*id, pg.add_node(*id));
        }
        for c in &self.connections {
            if let (Some(&f), Some(&t)) = (index.get(&c.from), index.get(&c.to)) {
                pg.add_edge(f, t, ());
            }
        }
        (pg, index)
    }

    /// Kahn's algorithm over the dependency edges.
    ///
    /// Deterministic: tie-breaking follows task id order because nodes are
    /// inserted in `BTreeMap` key order.
    pub fn topological_order(&self) -> TopoOrder {
        let (pg, _) = self.build_petgraph();

        let mut in_degree: HashMap<NodeIndex, usize> = pg
            .node_indices()
            .map(|n| (n, pg.neighbors_directed(n, Direction::Incoming).count()))
            .collect();

        let mut queue: VecDeque<NodeIndex> = pg
            .node_indices()
            .filter(|n| in_degree[n] == 0)
            .collect();

        let mut order = Vec::with_capacity(self.tasks.len());
        let mut visited = HashSet::new();

        while let Some(n) = queue.pop_front() {
            visited.insert(n);
            order.push(pg[n]);
            for succ in pg.neighbors_directed(n, Direction::Outgoing) {
                let deg = in_degree.get_mut(&succ).map(|d| {
                    *d -= 1;
                    *d
                });
                if deg == Some(0) {
                    queue.push_back(succ);
                }
            }
        }

        let cycle: Vec<TaskId> = pg
            .node_indices()
            .filter(|n| !visited.contains(n))
            .map(|n| pg[n])
            .collect();

        TopoOrder { order, cycle }
    }

    /// Unblock dependents of a completed task.
    ///
    /// For every task depending on `completed` that is still blocked, not
    /// locked, and has all of its dependencies done, applies
    /// `DependenciesSatisfied`. Returns the transitions that happened.
    pub fn cascade_on_completion(&mut self, completed: &TaskId) -> Result<Vec<StateChange>> {
        if !self.tasks.contains_key(completed) {
            return Err(Error::TaskNotFound(*completed));
        }
        let mut changes = Vec::new();
        for dependent in self.dependents_of(completed) {
            let eligible = match self.tasks.get(&dependent) {
                Some(t) => t.status == TaskStatus::Blocked && !t.locked,
                None => false,
            };
            if eligible && self.dependencies_satisfied(&dependent) {
                if let Some(task) = self.tasks.get_mut(&dependent) {
                    changes.push(task.apply(TaskEvent::DependenciesSatisfied)?);
                }
            }
        }
        Ok(changes)
    }

    /// Recalculate readiness from scratch, in topological order.
    ///
    /// Promotes blocked, unlocked tasks whose dependencies are all done
    /// (including tasks with no dependencies). Running it twice in a row
    /// yields no changes the second time.
    pub fn recompute_statuses(&mut self) -> Vec<StateChange> {
        let topo = self.topological_order();
        let mut changes = Vec::new();
        for id in &topo.order {
            let eligible = match self.tasks.get(id) {
                Some(t) => t.status == TaskStatus::Blocked && !t.locked,
                None => false,
            };
            if eligible && self.dependencies_satisfied(id) {
                if let Some(task) = self.tasks.get_mut(id) {
                    if let Ok(change) = task.apply(TaskEvent::DependenciesSatisfied) {
                        changes.push(change);
                    }
                }
            }
        }
        changes
    }

    /// Per-status counts, mostly for display.
    pub fn status_counts(&self) -> HashMap<TaskStatus, usize> {
        let mut counts: HashMap<TaskStatus, usize> =
            TaskStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for task in self.tasks.values() {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        counts
    }
}
