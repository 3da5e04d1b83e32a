//! Dependency resolution for one admission walk.
//!
//! A [`DependencyResolver`] is created fresh for every top-level admission
//! and dropped afterwards. It records every "needs" edge it walks into a
//! [`DependencyGraph`] so cycles can be found with Tarjan's strongly
//! connected components.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::Arc,
};

use itertools::Itertools;
use petgraph::{
    algo::tarjan_scc,
    graph::{DiGraph, NodeIndex},
};

use crate::{
    change::{Change, ChangeKey, TriggerEvent},
    manager::{PipelineState, RejectReason},
    queue::ChangeQueue,
    source::SourceContext,
    Result,
};

/// Outcome of resolving a change's prerequisites.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prerequisites {
    /// Nothing needs to be admitted ahead of the change
    Satisfied,
    /// The change can not be admitted right now
    Blocked(RejectReason),
    /// These changes must be admitted ahead of it, in order
    Needed(Vec<Arc<Change>>),
}

/// Directed "needs" graph: an edge `a -> b` means `a` needs `b`.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    graph: DiGraph<ChangeKey, ()>,
    nodes: HashMap<ChangeKey, NodeIndex>,
}

impl DependencyGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn node(&mut self, key: &ChangeKey) -> NodeIndex {
        if let Some(index) = self.nodes.get(key) {
            return *index;
        }
        let index = self.graph.add_node(key.clone());
        self.nodes.insert(key.clone(), index);
        index
    }

    /// Record that `change` needs `needed`
    pub fn add_edge(&mut self, change: &ChangeKey, needed: &ChangeKey) {
        let from = self.node(change);
        let to = self.node(needed);
        self.graph.update_edge(from, to, ());
    }

    /// Number of changes in the graph
    #[must_use]
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Members of the cycle containing `key`, in the order they were first
    /// seen, or an empty list if `key` is not part of a cycle.
    ///
    /// A change can be part of at most one strongly connected component.
    #[must_use]
    pub fn cycle_containing(&self, key: &ChangeKey) -> Vec<ChangeKey> {
        let Some(target) = self.nodes.get(key) else {
            return Vec::new();
        };
        tarjan_scc(&self.graph)
            .into_iter()
            .filter(|component| component.len() > 1)
            .find(|component| component.contains(target))
            .map(|component| {
                component
                    .into_iter()
                    .sorted()
                    .map(|index| self.graph[index].clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Per-walk resolver of prerequisites, cycles and dependents.
#[derive(Debug, Default)]
pub struct DependencyResolver {
    graph: DependencyGraph,
    /// Commit-level needs re-derived during this walk
    refreshed: HashMap<ChangeKey, Vec<ChangeKey>>,
    max_dependencies: Option<usize>,
}

impl DependencyResolver {
    /// Create a resolver; `max_dependencies` bounds the graph size
    #[must_use]
    pub fn new(max_dependencies: Option<usize>) -> Self {
        Self {
            max_dependencies,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Declared prerequisites of `change`, using commit-level needs
    /// re-derived during this walk when available.
    #[must_use]
    pub fn needs_for(&self, change: &Change) -> Vec<ChangeKey> {
        match self.refreshed.get(&change.key) {
            None => change.needs_changes(),
            Some(commit) => change
                .git_needs_changes()
                .iter()
                .chain(commit)
                .unique()
                .cloned()
                .collect(),
        }
    }

    async fn refresh_commit_dependencies(
        &mut self,
        change: &Change,
        sources: SourceContext<'_>,
        event: &TriggerEvent,
    ) -> Result<()> {
        let stale = change
            .dependencies
            .links()
            .is_some_and(crate::change::DependencyLinks::needs_refresh);
        if !stale || self.refreshed.contains_key(&change.key) {
            return Ok(());
        }
        tracing::debug!(change = %change.key, "Updating commit dependencies");
        let mut dependencies = Vec::new();
        for key in sources.commit_dependencies(change, event).await? {
            if dependencies.contains(&key) {
                continue;
            }
            match sources.get_change(&key, event).await? {
                Some(dep) if !dep.is_merged => dependencies.push(key),
                Some(_) => {}
                None => {
                    tracing::debug!(
                        change = %change.key,
                        dependency = %key,
                        "Ignoring unknown commit dependency"
                    );
                }
            }
        }
        self.refreshed.insert(change.key.clone(), dependencies);
        Ok(())
    }

    /// Decide what must be admitted ahead of `change`.
    ///
    /// Merged prerequisites are skipped, as are prerequisites already queued
    /// ahead in the change's queue. Any other prerequisite must share the
    /// queue, be the current patchset and independently pass the driver's
    /// mergeability check, otherwise the whole resolution is blocked.
    ///
    /// # Errors
    ///
    /// Propagates driver failures and timeouts.
    pub async fn resolve_prerequisites(
        &mut self,
        change: &Change,
        state: &PipelineState,
        sources: SourceContext<'_>,
        event: &TriggerEvent,
    ) -> Result<Prerequisites> {
        tracing::debug!(change = %change.key, "Checking for changes needed by change");
        self.refresh_commit_dependencies(change, sources, event).await?;
        if !change.supports_dependencies() {
            return Ok(Prerequisites::Satisfied);
        }
        let needs = self.needs_for(change);
        if needs.is_empty() {
            tracing::debug!(change = %change.key, "No changes needed");
            return Ok(Prerequisites::Satisfied);
        }

        let change_queue = state.queue_for_project(change.project());
        let mut needed_changes: Vec<Arc<Change>> = Vec::new();
        for needed_key in needs {
            let Some(needed) = sources.get_change(&needed_key, event).await? else {
                return Ok(Prerequisites::Blocked(RejectReason::DependencyNotFound {
                    change: change.key.clone(),
                    needed: needed_key,
                }));
            };
            if needed.is_merged {
                tracing::debug!(change = %change.key, needed = %needed.key, "Needed change is merged");
                continue;
            }

            self.graph.add_edge(&change.key, &needed.key);
            if let Some(limit) = self.max_dependencies {
                if self.graph.len() > limit {
                    tracing::debug!(change = %change.key, limit, "Dependency graph is too large");
                    return Ok(Prerequisites::Blocked(RejectReason::TooManyDependencies {
                        change: change.key.clone(),
                        limit,
                    }));
                }
            }

            if change_queue.is_none() || state.queue_for_project(needed.project()) != change_queue {
                tracing::debug!(
                    change = %change.key,
                    needed = %needed.key,
                    "Needed change does not share a change queue"
                );
                return Ok(Prerequisites::Blocked(RejectReason::CrossQueueDependency {
                    change: change.key.clone(),
                    needed: needed.key.clone(),
                }));
            }
            if !needed.is_current_patchset {
                tracing::debug!(needed = %needed.key, "Needed change is not the current patchset");
                return Ok(Prerequisites::Blocked(RejectReason::StaleDependency {
                    change: change.key.clone(),
                    needed: needed.key.clone(),
                }));
            }
            if change_queue.is_some_and(|queue| state.is_change_in_queue(&needed.key, queue)) {
                tracing::debug!(needed = %needed.key, "Needed change is already ahead in the queue");
                continue;
            }
            if !sources.can_merge(&needed, event, false).await? {
                tracing::debug!(needed = %needed.key, "Change is needed but can not be merged");
                return Ok(Prerequisites::Blocked(RejectReason::UnmergeablePrerequisite {
                    change: change.key.clone(),
                    needed: needed.key.clone(),
                }));
            }
            tracing::debug!(needed = %needed.key, "Change is needed");
            if !needed_changes.iter().any(|c| c.key == needed.key) {
                needed_changes.push(needed);
            }
        }

        if needed_changes.is_empty() {
            Ok(Prerequisites::Satisfied)
        } else {
            Ok(Prerequisites::Needed(needed_changes))
        }
    }

    /// Members of the dependency cycle `key` belongs to, as recorded so far.
    #[must_use]
    pub fn detect_cycle(&self, key: &ChangeKey) -> Vec<ChangeKey> {
        let cycle = self.graph.cycle_containing(key);
        if !cycle.is_empty() {
            tracing::debug!(change = %key, members = cycle.len(), "Dependency cycle detected");
        }
        cycle
    }

    /// Whether the walk should descend into `needed` from `change`.
    ///
    /// A change already visited in this walk is not processed again, unless
    /// it is a commit-stack parent of `change` that is not on the current
    /// recursion path: commit order must be preserved even when the same
    /// change was first reached through a logical "needs" edge.
    #[must_use]
    pub fn should_descend(
        change: &Change,
        needed: &ChangeKey,
        history: &[ChangeKey],
        path: &[ChangeKey],
    ) -> bool {
        !history.contains(needed) || (change.has_git_parent(needed) && !path.contains(needed))
    }

    /// Changes that declare a need on `change`: its statically known reverse
    /// dependents plus a live query of every distinct source attached to the
    /// queue's projects, without duplicates.
    ///
    /// # Errors
    ///
    /// Propagates driver failures and timeouts.
    pub async fn find_dependents(
        &self,
        change: &Change,
        queue: &ChangeQueue,
        sources: SourceContext<'_>,
        event: &TriggerEvent,
    ) -> Result<Vec<Arc<Change>>> {
        tracing::debug!(change = %change.key, "Checking for changes needing change");
        if !change.supports_dependencies() {
            return Ok(Vec::new());
        }

        let mut seen: HashSet<ChangeKey> = HashSet::new();
        let mut dependents = Vec::new();
        for key in change.needed_by_changes() {
            if !seen.insert(key.clone()) {
                continue;
            }
            if let Some(dependent) = sources.get_change(key, event).await? {
                dependents.push(dependent);
            }
        }

        let connections: BTreeSet<&str> = queue
            .projects()
            .iter()
            .map(|project| project.connection.as_str())
            .chain(std::iter::once(change.project().connection.as_str()))
            .collect();
        for connection in connections {
            tracing::debug!(connection, "Checking source for dependents");
            for dependent in sources
                .changes_depending_on(connection, change, queue.projects())
                .await?
            {
                if seen.insert(dependent.key.clone()) {
                    dependents.push(dependent);
                }
            }
        }

        tracing::debug!(
            change = %change.key,
            dependents = ?dependents.iter().map(|c| c.key.to_string()).collect::<Vec<_>>(),
            "Following changes"
        );
        Ok(dependents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::Project;

    fn key(number: u64) -> ChangeKey {
        ChangeKey::new(Project::new("gerrit", "org/a"), number, 1)
    }

    #[test]
    fn test_chain_has_no_cycle() {
        let mut graph = DependencyGraph::new();
        graph.add_edge(&key(3), &key(2));
        graph.add_edge(&key(2), &key(1));
        assert!(graph.cycle_containing(&key(3)).is_empty());
        assert_eq!(graph.len(), 3);
    }

    #[test]
    fn test_two_node_cycle() {
        let mut graph = DependencyGraph::new();
        graph.add_edge(&key(1), &key(2));
        graph.add_edge(&key(2), &key(1));
        assert_eq!(graph.cycle_containing(&key(2)), vec![key(1), key(2)]);
    }

    #[test]
    fn test_long_cycle_with_tail() {
        let mut graph = DependencyGraph::new();
        graph.add_edge(&key(9), &key(1));
        graph.add_edge(&key(1), &key(2));
        graph.add_edge(&key(2), &key(3));
        graph.add_edge(&key(3), &key(1));
        assert_eq!(graph.cycle_containing(&key(3)), vec![key(1), key(2), key(3)]);
        assert!(graph.cycle_containing(&key(9)).is_empty());
    }

    #[test]
    fn test_duplicate_edges_are_collapsed() {
        let mut graph = DependencyGraph::new();
        graph.add_edge(&key(1), &key(2));
        graph.add_edge(&key(1), &key(2));
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn test_should_descend_guards_revisits() {
        let mut child = Change::new(Project::new("gerrit", "org/a"), "main", 5, 1);
        child.dependencies = crate::change::Dependencies::HasDependencies(
            crate::change::DependencyLinks {
                git_needs_changes: vec![key(4)],
                commit_needs_changes: Some(vec![key(7)]),
                ..crate::change::DependencyLinks::default()
            },
        );

        assert!(DependencyResolver::should_descend(&child, &key(7), &[], &[]));
        assert!(!DependencyResolver::should_descend(&child, &key(7), &[key(7)], &[]));
        assert!(DependencyResolver::should_descend(&child, &key(4), &[key(4)], &[]));
        assert!(!DependencyResolver::should_descend(&child, &key(4), &[key(4)], &[key(4)]));
    }
}
