//! Branch protection cache for one connection.
//!
//! Two named maps are kept per connection:
//! - `exclude_unprotected`: project -> protected branches only
//! - `include_unprotected`: project -> all branches
//!
//! Entries are filled lazily from the driver and invalidated by branch ref
//! events. An entry is only ever replaced wholesale, so a project present in
//! `include_unprotected` always holds its complete branch list.

use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::{change::TriggerEvent, source::Source, Result};

/// How a branch ref event changed the branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchRefChange {
    /// Old revision was null
    Created,
    /// New revision is null
    Deleted,
    /// Both revisions are real
    Updated,
}

impl BranchRefChange {
    /// Classify a ref update by its old and new revisions.
    #[must_use]
    pub fn classify(old_rev: &str, new_rev: &str) -> Self {
        if is_null_revision(old_rev) {
            Self::Created
        } else if is_null_revision(new_rev) {
            Self::Deleted
        } else {
            Self::Updated
        }
    }
}

/// Whether a revision is the all-zero null object id (SHA-1 or SHA-256 width).
#[must_use]
pub fn is_null_revision(rev: &str) -> bool {
    !rev.is_empty() && rev.bytes().all(|b| b == b'0')
}

#[derive(Debug, Default)]
struct CacheState {
    exclude_unprotected: HashMap<String, Vec<String>>,
    include_unprotected: HashMap<String, Vec<String>>,
    /// Bumped by every invalidation so a racing fetch cannot repopulate
    generation: u64,
}

impl CacheState {
    const fn map(&self, exclude_unprotected: bool) -> &HashMap<String, Vec<String>> {
        if exclude_unprotected {
            &self.exclude_unprotected
        } else {
            &self.include_unprotected
        }
    }

    fn map_mut(&mut self, exclude_unprotected: bool) -> &mut HashMap<String, Vec<String>> {
        if exclude_unprotected {
            &mut self.exclude_unprotected
        } else {
            &mut self.include_unprotected
        }
    }
}

/// Per-connection cache of project branch lists.
pub struct BranchProtectionCache {
    connection: String,
    source: Arc<dyn Source>,
    state: RwLock<CacheState>,
}

impl BranchProtectionCache {
    /// Create an empty cache backed by `source`
    #[must_use]
    pub fn new(connection: impl Into<String>, source: Arc<dyn Source>) -> Self {
        Self {
            connection: connection.into(),
            source,
            state: RwLock::new(CacheState::default()),
        }
    }

    /// Ask the driver whether a branch is protected; `None` means unknown.
    ///
    /// # Errors
    ///
    /// Propagates driver failures.
    pub async fn is_branch_protected(
        &self,
        project: &str,
        branch: &str,
        event: Option<&TriggerEvent>,
    ) -> Result<Option<bool>> {
        self.source.is_branch_protected(project, branch, event).await
    }

    /// Branches of a project, fetched from the driver on first use.
    ///
    /// # Errors
    ///
    /// Propagates driver failures; nothing is cached in that case.
    pub async fn project_branches(&self, project: &str, exclude_unprotected: bool) -> Result<Vec<String>> {
        let generation = {
            let state = self.state.read().await;
            if let Some(branches) = state.map(exclude_unprotected).get(project) {
                return Ok(branches.clone());
            }
            state.generation
        };

        let branches = self
            .source
            .fetch_project_branches(project, exclude_unprotected)
            .await?;

        let mut state = self.state.write().await;
        if state.generation == generation {
            state
                .map_mut(exclude_unprotected)
                .insert(project.to_string(), branches.clone());
        } else {
            tracing::debug!(
                connection = %self.connection,
                project,
                "Branch cache invalidated during fetch, not caching result"
            );
        }
        Ok(branches)
    }

    /// The cached branch list without fetching
    pub async fn cached_branches(&self, project: &str, exclude_unprotected: bool) -> Option<Vec<String>> {
        self.state
            .read()
            .await
            .map(exclude_unprotected)
            .get(project)
            .cloned()
    }

    /// Wipe both maps for every project.
    pub async fn clear_all(&self) {
        let mut state = self.state.write().await;
        state.exclude_unprotected.clear();
        state.include_unprotected.clear();
        state.generation = state.generation.wrapping_add(1);
        tracing::debug!(connection = %self.connection, "Cleared branch cache");
    }

    /// Wipe both maps for one project.
    pub async fn clear_project(&self, project: &str) {
        let mut state = self.state.write().await;
        state.exclude_unprotected.remove(project);
        state.include_unprotected.remove(project);
        state.generation = state.generation.wrapping_add(1);
        tracing::debug!(connection = %self.connection, project, "Cleared branch cache for project");
    }

    /// React to a branch ref update.
    ///
    /// Creation and deletion clear the project outright: a new branch cannot
    /// be protected yet and a deleted one can no longer be checked. Updates
    /// fall through to [`Self::check_protection_drift`].
    pub async fn on_branch_ref_event(
        &self,
        project: &str,
        branch: &str,
        old_rev: &str,
        new_rev: &str,
        event: Option<&TriggerEvent>,
    ) -> BranchRefChange {
        let change = BranchRefChange::classify(old_rev, new_rev);
        match change {
            BranchRefChange::Created | BranchRefChange::Deleted => {
                tracing::debug!(
                    connection = %self.connection,
                    project,
                    branch,
                    ?change,
                    "Clearing branch cache due to branch creation or deletion"
                );
                self.clear_project(project).await;
            }
            BranchRefChange::Updated => {
                self.check_protection_drift(project, branch, None, event).await;
            }
        }
        change
    }

    /// Purge `exclude_unprotected[project]` if the branch's protection no
    /// longer matches its presence there. Returns whether an entry was purged.
    ///
    /// An unknown status (or a driver failure) counts as protected.
    /// `include_unprotected` does not depend on protection and is left alone.
    pub async fn check_protection_drift(
        &self,
        project: &str,
        branch: &str,
        known_protected: Option<bool>,
        event: Option<&TriggerEvent>,
    ) -> bool {
        let protected = match known_protected {
            Some(protected) => protected,
            None => match self.is_branch_protected(project, branch, event).await {
                Ok(Some(protected)) => protected,
                Ok(None) => true,
                Err(e) => {
                    tracing::warn!(
                        connection = %self.connection,
                        project,
                        branch,
                        "Unable to check branch protection, assuming protected: {e}"
                    );
                    true
                }
            },
        };

        let mut state = self.state.write().await;
        let listed = state
            .exclude_unprotected
            .get(project)
            .is_some_and(|branches| branches.iter().any(|b| b == branch));
        if listed == protected {
            return false;
        }

        let purged = state.exclude_unprotected.remove(project).is_some();
        state.generation = state.generation.wrapping_add(1);
        if purged {
            tracing::debug!(
                connection = %self.connection,
                project,
                branch,
                protected,
                "Clearing protected branch cache after protection change"
            );
        }
        purged
    }
}

impl std::fmt::Debug for BranchProtectionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BranchProtectionCache")
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NULL_SHA1: &str = "0000000000000000000000000000000000000000";

    #[test]
    fn test_classify_ref_events() {
        assert_eq!(BranchRefChange::classify(NULL_SHA1, "abc123"), BranchRefChange::Created);
        assert_eq!(BranchRefChange::classify("abc123", NULL_SHA1), BranchRefChange::Deleted);
        assert_eq!(BranchRefChange::classify("abc123", "def456"), BranchRefChange::Updated);
    }

    #[test]
    fn test_null_revision_detection() {
        assert!(is_null_revision(NULL_SHA1));
        assert!(is_null_revision(&"0".repeat(64)));
        assert!(!is_null_revision(""));
        assert!(!is_null_revision("0000a"));
    }
}
