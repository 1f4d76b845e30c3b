//! Event graph storage and primitives

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Write as _;

use indexmap::IndexMap;
use smallvec::SmallVec;
use thiserror::Error;

use super::node::NodeRef;
use crate::runtime::package::WeakPackageRef;

/// Misuse of a graph primitive. Always a loader bug.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("node {node} is not in the event graph")]
    UnknownNode { node: NodeRef },

    #[error("node {node} was added twice")]
    DuplicateNode { node: NodeRef },

    #[error("arc {prerequisite} -> {dependent} targets a node that already fired")]
    ArcToFiredNode {
        prerequisite: NodeRef,
        dependent: NodeRef,
    },

    #[error("node {node} fired twice")]
    DoubleFire { node: NodeRef },

    #[error("prerequisite count underflow on {node}")]
    PrerequisiteUnderflow { node: NodeRef },

    #[error("node {node} removed before it was done (prerequisites {prerequisites}, fired {fired})")]
    PrematureRemove {
        node: NodeRef,
        prerequisites: u32,
        fired: bool,
    },

    #[error("node {node} has zero prerequisites but was never queued")]
    NeverQueued { node: NodeRef },

    #[error("event graph contains a cycle through {node} ({} nodes)", path.len())]
    Cycle { node: NodeRef, path: Vec<NodeRef> },

    #[error("no outstanding I/O and no queued work, yet {remaining} nodes remain ({boot_waiting} waiting on bootstrap)")]
    Stuck { remaining: usize, boot_waiting: usize },
}

/// Lifetime counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GraphStats {
    pub nodes_added: usize,
    pub arcs_added: usize,
    pub nodes_fired: usize,
    pub nodes_removed: usize,
    pub peak_nodes: usize,
}

#[derive(Debug)]
struct NodeState {
    prerequisites: u32,
    fired: bool,
    dependents: SmallVec<[NodeRef; 4]>,
}

/// All live nodes of every in-flight package.
///
/// # Example
///
/// ```
/// use asyncload::runtime::dag::{EventGraph, NodeRef, Phase};
/// use asyncload::runtime::package::WeakPackageRef;
///
/// let pkg = WeakPackageRef::new(0, 1);
/// let summary = NodeRef::package_node(pkg, Phase::LoadSummary);
/// let imports = NodeRef::package_node(pkg, Phase::SetupImports);
///
/// let mut graph = EventGraph::new();
/// graph.add_node(summary, false, 0).unwrap();
/// graph.add_node(imports, true, 0).unwrap();
/// graph.add_arc(summary, imports).unwrap();
/// graph.fire_externally(summary).unwrap();
/// graph.done_adding_prerequisites(imports, true).unwrap();
/// graph.remove_node(summary).unwrap();
/// assert_eq!(graph.pop_fired(), Some(imports));
/// ```
#[derive(Debug, Default)]
pub struct EventGraph {
    nodes: IndexMap<NodeRef, NodeState>,
    per_package: HashMap<WeakPackageRef, usize>,
    fired: VecDeque<NodeRef>,
    cross_package_arcs: usize,
    stats: GraphStats,
}

impl EventGraph {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(
        &self,
        node: NodeRef,
    ) -> bool {
        self.nodes.contains_key(&node)
    }

    /// Present and not yet fired, so it may still gain prerequisites.
    pub fn is_pending(
        &self,
        node: NodeRef,
    ) -> bool {
        self.nodes.get(&node).is_some_and(|s| !s.fired)
    }

    pub fn is_fired(
        &self,
        node: NodeRef,
    ) -> Option<bool> {
        self.nodes.get(&node).map(|s| s.fired)
    }

    pub fn prerequisites(
        &self,
        node: NodeRef,
    ) -> Option<u32> {
        self.nodes.get(&node).map(|s| s.prerequisites)
    }

    /// Live nodes owned by `package`.
    pub fn package_node_count(
        &self,
        package: WeakPackageRef,
    ) -> usize {
        self.per_package.get(&package).copied().unwrap_or(0)
    }

    /// Packages that still own nodes.
    pub fn packages_with_nodes(&self) -> usize {
        self.per_package.len()
    }

    /// Arcs between nodes of different packages not yet released.
    pub fn cross_package_arcs(&self) -> usize {
        self.cross_package_arcs
    }

    pub fn stats(&self) -> GraphStats {
        self.stats
    }

    /// Add a node. It never fires here; a held node keeps one extra
    /// prerequisite until [`done_adding_prerequisites`](Self::done_adding_prerequisites).
    pub fn add_node(
        &mut self,
        node: NodeRef,
        hold: bool,
        implicit_prerequisites: u32,
    ) -> Result<(), GraphError> {
        if self.nodes.contains_key(&node) {
            return Err(GraphError::DuplicateNode { node });
        }
        self.nodes.insert(
            node,
            NodeState {
                prerequisites: u32::from(hold) + implicit_prerequisites,
                fired: false,
                dependents: SmallVec::new(),
            },
        );
        *self.per_package.entry(node.package).or_insert(0) += 1;
        self.stats.nodes_added += 1;
        self.stats.peak_nodes = self.stats.peak_nodes.max(self.nodes.len());
        Ok(())
    }

    /// `dependent` waits for `prerequisite` to be removed.
    pub fn add_arc(
        &mut self,
        prerequisite: NodeRef,
        dependent: NodeRef,
    ) -> Result<(), GraphError> {
        if !self.nodes.contains_key(&prerequisite) {
            return Err(GraphError::UnknownNode { node: prerequisite });
        }
        let state = self
            .nodes
            .get_mut(&dependent)
            .ok_or(GraphError::UnknownNode { node: dependent })?;
        if state.fired {
            return Err(GraphError::ArcToFiredNode {
                prerequisite,
                dependent,
            });
        }
        state.prerequisites += 1;
        if let Some(pre) = self.nodes.get_mut(&prerequisite) {
            pre.dependents.push(dependent);
        }
        if prerequisite.package != dependent.package {
            self.cross_package_arcs += 1;
        }
        self.stats.arcs_added += 1;
        Ok(())
    }

    /// Mark a node as fired by something outside the graph (I/O, bootstrap).
    pub fn fire_externally(
        &mut self,
        node: NodeRef,
    ) -> Result<(), GraphError> {
        let state = self
            .nodes
            .get_mut(&node)
            .ok_or(GraphError::UnknownNode { node })?;
        if state.fired {
            return Err(GraphError::DoubleFire { node });
        }
        state.fired = true;
        self.stats.nodes_fired += 1;
        Ok(())
    }

    /// Release the hold taken in [`add_node`](Self::add_node) and fire the
    /// node if nothing else is outstanding. Returns whether it fired.
    pub fn done_adding_prerequisites(
        &mut self,
        node: NodeRef,
        was_held: bool,
    ) -> Result<bool, GraphError> {
        let state = self
            .nodes
            .get_mut(&node)
            .ok_or(GraphError::UnknownNode { node })?;
        if state.fired {
            return Err(GraphError::DoubleFire { node });
        }
        if was_held {
            if state.prerequisites == 0 {
                return Err(GraphError::PrerequisiteUnderflow { node });
            }
            state.prerequisites -= 1;
        }
        if state.prerequisites == 0 {
            self.fire(node);
            return Ok(true);
        }
        Ok(false)
    }

    /// Remove a fired node with nothing outstanding, releasing its dependents.
    pub fn remove_node(
        &mut self,
        node: NodeRef,
    ) -> Result<(), GraphError> {
        let state = self
            .nodes
            .get(&node)
            .ok_or(GraphError::UnknownNode { node })?;
        if !state.fired || state.prerequisites != 0 {
            return Err(GraphError::PrematureRemove {
                node,
                prerequisites: state.prerequisites,
                fired: state.fired,
            });
        }
        let Some(state) = self.nodes.swap_remove(&node) else {
            return Err(GraphError::UnknownNode { node });
        };
        self.forget(node.package);
        self.stats.nodes_removed += 1;

        for dependent in state.dependents {
            if dependent.package != node.package {
                self.cross_package_arcs = self.cross_package_arcs.saturating_sub(1);
            }
            let waiting = self
                .nodes
                .get_mut(&dependent)
                .ok_or(GraphError::UnknownNode { node: dependent })?;
            if waiting.prerequisites == 0 {
                return Err(GraphError::PrerequisiteUnderflow { node: dependent });
            }
            waiting.prerequisites -= 1;
            if waiting.prerequisites == 0 {
                if waiting.fired {
                    return Err(GraphError::DoubleFire { node: dependent });
                }
                self.fire(dependent);
            }
        }
        Ok(())
    }

    fn fire(
        &mut self,
        node: NodeRef,
    ) {
        if let Some(state) = self.nodes.get_mut(&node) {
            state.fired = true;
        }
        self.stats.nodes_fired += 1;
        self.fired.push_back(node);
    }

    fn forget(
        &mut self,
        package: WeakPackageRef,
    ) {
        if let Some(count) = self.per_package.get_mut(&package) {
            *count -= 1;
            if *count == 0 {
                self.per_package.remove(&package);
            }
        }
    }

    /// Next node that fired and still has to be routed to its package.
    pub fn pop_fired(&mut self) -> Option<NodeRef> {
        self.fired.pop_front()
    }

    pub fn has_fired(&self) -> bool {
        !self.fired.is_empty()
    }

    /// Drop every node of a package without firing anything. Used when a
    /// package is canceled.
    pub fn remove_package_nodes(
        &mut self,
        package: WeakPackageRef,
    ) -> usize {
        let before = self.nodes.len();
        let mut released = 0;
        self.nodes.retain(|node, state| {
            if node.package == package {
                released += state.dependents.iter().filter(|d| d.package != package).count();
                false
            } else {
                true
            }
        });
        let removed = before - self.nodes.len();
        for state in self.nodes.values_mut() {
            let len = state.dependents.len();
            state.dependents.retain(|d| d.package != package);
            released += len - state.dependents.len();
        }
        self.cross_package_arcs = self.cross_package_arcs.saturating_sub(released);
        self.fired.retain(|n| n.package != package);
        self.per_package.remove(&package);
        self.stats.nodes_removed += removed;
        removed
    }

    /// Safety net run when the loader is idle: every node left must be a
    /// fired node parked on bootstrap registration or wait on one, and no
    /// arcs may form a cycle. Returns the number of nodes waiting on
    /// bootstrap.
    pub fn check_for_cycles(
        &self,
        initial_load: bool,
    ) -> Result<usize, GraphError> {
        let mut boot_waiting = 0;
        for (node, state) in &self.nodes {
            if state.prerequisites == 0 {
                if initial_load && state.fired {
                    boot_waiting += 1;
                } else {
                    return Err(GraphError::NeverQueued { node: *node });
                }
            }
        }

        if let Some((node, path)) = self.find_cycle() {
            return Err(GraphError::Cycle { node, path });
        }

        // Nodes downstream of a parked bootstrap node wait with it.
        if boot_waiting == 0 && !self.nodes.is_empty() {
            return Err(GraphError::Stuck {
                remaining: self.nodes.len(),
                boot_waiting,
            });
        }
        Ok(boot_waiting)
    }

    /// Iterative depth-first search over arcs.
    fn find_cycle(&self) -> Option<(NodeRef, Vec<NodeRef>)> {
        let mut done: HashSet<NodeRef> = HashSet::new();
        let mut on_stack: HashSet<NodeRef> = HashSet::new();
        let mut stack: Vec<(NodeRef, usize)> = Vec::new();

        for root in self.nodes.keys() {
            if done.contains(root) {
                continue;
            }
            stack.push((*root, 0));
            on_stack.insert(*root);
            while let Some(top) = stack.last_mut() {
                let (node, index) = *top;
                top.1 += 1;
                let dependents = self.nodes.get(&node).map(|s| s.dependents.as_slice()).unwrap_or(&[]);
                if let Some(child) = dependents.get(index).copied() {
                    if on_stack.contains(&child) {
                        let start = stack.iter().position(|(n, _)| *n == child).unwrap_or(0);
                        let path = stack[start..].iter().map(|(n, _)| *n).collect();
                        return Some((child, path));
                    }
                    if !done.contains(&child) {
                        on_stack.insert(child);
                        stack.push((child, 0));
                    }
                } else {
                    on_stack.remove(&node);
                    done.insert(node);
                    stack.pop();
                }
            }
        }
        None
    }

    /// Human readable listing of up to `limit` nodes, for fatal reports.
    pub fn describe(
        &self,
        limit: usize,
    ) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} nodes in {} packages, {} cross-package arcs",
            self.nodes.len(),
            self.per_package.len(),
            self.cross_package_arcs
        );
        for (node, state) in self.nodes.iter().take(limit) {
            let _ = write!(
                out,
                "  {} prerequisites={} fired={}",
                node, state.prerequisites, state.fired
            );
            if !state.dependents.is_empty() {
                let waiting: Vec<String> = state.dependents.iter().map(|d| d.to_string()).collect();
                let _ = write!(out, " -> [{}]", waiting.join(", "));
            }
            out.push('\n');
        }
        if self.nodes.len() > limit {
            let _ = writeln!(out, "  ... {} more", self.nodes.len() - limit);
        }
        out
    }
}
