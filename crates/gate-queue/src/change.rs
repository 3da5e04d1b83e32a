//! Change model as supplied by the source drivers.
//!
//! Changes are owned by the drivers and are read-only here. Dependencies
//! between changes are expressed by [`ChangeKey`] so a cyclic "needs" graph
//! can be represented without reference cycles.

use std::fmt;

use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// A project hosted on a named connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Project {
    /// Connection (source driver) the project lives on
    pub connection: String,
    /// Canonical project name, e.g. `org/repo`
    pub name: String,
}

impl Project {
    /// Create a new project reference
    #[must_use]
    pub fn new(connection: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            connection: connection.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Project {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Identity of one patchset of a change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChangeKey {
    /// Project (and connection) the change belongs to
    pub project: Project,
    /// Change (or pull request) number
    pub number: u64,
    /// Patchset (revision) number
    pub patchset: u32,
}

impl ChangeKey {
    /// Create a new change key
    #[must_use]
    pub const fn new(project: Project, number: u64, patchset: u32) -> Self {
        Self {
            project,
            number,
            patchset,
        }
    }

    /// Whether `self` is a newer patchset of the same change as `other`.
    #[must_use]
    pub fn is_update_of(&self, other: &Self) -> bool {
        self.project == other.project && self.number == other.number && self.patchset > other.patchset
    }
}

impl fmt::Display for ChangeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{},{}", self.project.name, self.number, self.patchset)
    }
}

/// Dependency links declared by a change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyLinks {
    /// Commit-stack parents (strict git order)
    pub git_needs_changes: Vec<ChangeKey>,
    /// Cross-repository `Depends-On` prerequisites; `None` if not yet derived
    pub commit_needs_changes: Option<Vec<ChangeKey>>,
    /// Statically known reverse dependents
    pub needed_by_changes: Vec<ChangeKey>,
    /// Request that `commit_needs_changes` be re-derived before use
    pub refresh_deps: bool,
}

impl DependencyLinks {
    /// Whether the commit-level dependencies must be re-derived.
    #[must_use]
    pub const fn needs_refresh(&self) -> bool {
        self.refresh_deps || self.commit_needs_changes.is_none()
    }
}

/// Whether a change type participates in dependency tracking at all.
///
/// Plain ref updates (branch pushes, tags) carry no dependencies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dependencies {
    /// Dependencies are not applicable to this change type
    NoDependencies,
    /// Dependencies are tracked
    HasDependencies(DependencyLinks),
}

impl Dependencies {
    /// The links, if this change tracks dependencies.
    #[must_use]
    pub const fn links(&self) -> Option<&DependencyLinks> {
        match self {
            Self::NoDependencies => None,
            Self::HasDependencies(links) => Some(links),
        }
    }
}

/// A proposed change under review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    /// Identity, including the project the change targets
    pub key: ChangeKey,
    /// Target branch
    pub branch: String,
    /// Already merged upstream
    pub is_merged: bool,
    /// Still the latest patchset of its change
    pub is_current_patchset: bool,
    /// Declared dependencies
    pub dependencies: Dependencies,
}

impl Change {
    /// Create an open, current change with no declared dependencies.
    #[must_use]
    pub fn new(project: Project, branch: impl Into<String>, number: u64, patchset: u32) -> Self {
        Self {
            key: ChangeKey::new(project, number, patchset),
            branch: branch.into(),
            is_merged: false,
            is_current_patchset: true,
            dependencies: Dependencies::HasDependencies(DependencyLinks {
                commit_needs_changes: Some(Vec::new()),
                ..DependencyLinks::default()
            }),
        }
    }

    /// Project the change targets
    #[must_use]
    pub const fn project(&self) -> &Project {
        &self.key.project
    }

    /// Whether the change tracks dependencies.
    #[must_use]
    pub const fn supports_dependencies(&self) -> bool {
        matches!(self.dependencies, Dependencies::HasDependencies(_))
    }

    /// Commit-stack parents.
    #[must_use]
    pub fn git_needs_changes(&self) -> &[ChangeKey] {
        self.dependencies
            .links()
            .map(|links| links.git_needs_changes.as_slice())
            .unwrap_or_default()
    }

    /// Statically known reverse dependents.
    #[must_use]
    pub fn needed_by_changes(&self) -> &[ChangeKey] {
        self.dependencies
            .links()
            .map(|links| links.needed_by_changes.as_slice())
            .unwrap_or_default()
    }

    /// All declared prerequisites: commit-stack parents first, then
    /// cross-repository needs, without duplicates.
    #[must_use]
    pub fn needs_changes(&self) -> Vec<ChangeKey> {
        let commit = self
            .dependencies
            .links()
            .and_then(|links| links.commit_needs_changes.as_deref())
            .unwrap_or_default();
        self.git_needs_changes()
            .iter()
            .chain(commit)
            .unique()
            .cloned()
            .collect()
    }

    /// Whether `other` is a strict commit-stack parent of this change.
    #[must_use]
    pub fn has_git_parent(&self, other: &ChangeKey) -> bool {
        self.git_needs_changes().contains(other)
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Change {}>", self.key)
    }
}

/// The external trigger that caused an admission attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// Event identifier used to correlate log lines
    pub id: String,
    /// When the event was received
    pub received_at: DateTime<Utc>,
}

impl TriggerEvent {
    /// Create a new event received now
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            received_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change_with_links(links: DependencyLinks) -> Change {
        let mut change = Change::new(Project::new("gerrit", "org/a"), "main", 1, 1);
        change.dependencies = Dependencies::HasDependencies(links);
        change
    }

    fn key(project: &str, number: u64, patchset: u32) -> ChangeKey {
        ChangeKey::new(Project::new("gerrit", project), number, patchset)
    }

    #[test]
    fn test_needs_changes_orders_git_first_and_dedupes() {
        let p = key("org/a", 2, 1);
        let q = key("org/b", 7, 3);
        let change = change_with_links(DependencyLinks {
            git_needs_changes: vec![p.clone()],
            commit_needs_changes: Some(vec![q.clone(), p.clone()]),
            ..DependencyLinks::default()
        });

        assert_eq!(change.needs_changes(), vec![p.clone(), q]);
        assert!(change.has_git_parent(&p));
    }

    #[test]
    fn test_no_dependencies_variant_has_empty_needs() {
        let mut change = Change::new(Project::new("gerrit", "org/a"), "main", 1, 1);
        change.dependencies = Dependencies::NoDependencies;

        assert!(!change.supports_dependencies());
        assert!(change.needs_changes().is_empty());
        assert!(change.needed_by_changes().is_empty());
    }

    #[test]
    fn test_is_update_of() {
        let old = key("org/a", 5, 1);
        let new = key("org/a", 5, 2);
        let other = key("org/a", 6, 3);

        assert!(new.is_update_of(&old));
        assert!(!old.is_update_of(&new));
        assert!(!other.is_update_of(&old));
    }

    #[test]
    fn test_unknown_commit_needs_requests_refresh() {
        let links = DependencyLinks::default();
        assert!(links.needs_refresh());

        let links = DependencyLinks {
            commit_needs_changes: Some(Vec::new()),
            ..DependencyLinks::default()
        };
        assert!(!links.needs_refresh());
    }
}
