//! Gate queue manager for one tenant pipeline.
//!
//! The manager owns the pipeline's queues and serializes every mutation
//! through one async lock. Admission walks hold the lock across driver
//! calls so two triggers can never interleave inside the same pipeline.

mod admission;
mod outcome;
mod state;

use std::{collections::BTreeSet, sync::Arc};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::Instrument;

use self::admission::AdmissionWalk;
pub use self::{
    outcome::{Admission, RejectReason},
    state::{ItemSnapshot, PipelineState, QueueSnapshot},
};
use crate::{
    branch_cache::BranchRefChange,
    change::{Change, ChangeKey, Project, TriggerEvent},
    config::PipelineConfig,
    queue::{BundleId, ItemId, QueueItem},
    source::{Connections, SourceContext},
    Error, Result,
};

/// Admission and queue bookkeeping for one dependent pipeline.
#[derive(Debug)]
pub struct GateQueueManager {
    config: PipelineConfig,
    connections: Arc<Connections>,
    state: Mutex<PipelineState>,
}

impl GateQueueManager {
    /// Create a manager with the shared queues named in `config`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if the configuration does not validate.
    pub fn new(config: PipelineConfig, connections: Arc<Connections>) -> Result<Self> {
        config.validate()?;
        let state = PipelineState::new(&config);
        tracing::info!(
            pipeline = %config.name,
            tenant = %config.tenant,
            shared_queues = config.queues.len(),
            "Created gate queue manager"
        );
        Ok(Self {
            config,
            connections,
            state: Mutex::new(state),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    #[must_use]
    pub fn connections(&self) -> &Connections {
        &self.connections
    }

    fn sources(&self) -> SourceContext<'_> {
        SourceContext {
            connections: &self.connections,
            deadline: self.config.source_timeout(),
            allow_needs: &self.config.submit_allow_needs,
            tenant: &self.config.tenant,
        }
    }

    /// Try to admit `change`, pulling in its prerequisites ahead of it and
    /// its waiting dependents behind it.
    ///
    /// Admission is all or nothing: if the change is rejected, nothing the
    /// walk pulled in on its behalf stays queued. Driver failures and
    /// timeouts surface as [`RejectReason::SourceUnavailable`].
    pub async fn add_change(&self, change: Arc<Change>, event: &TriggerEvent) -> Admission {
        let span = tracing::info_span!(
            "admission",
            pipeline = %self.config.name,
            event_id = %event.id,
            change = %change.key,
        );
        async {
            let mut state = self.state.lock().await;
            let outcome = AdmissionWalk::new(
                &mut state,
                self.sources(),
                event,
                self.config.max_dependencies,
            )
            .add_change(change)
            .await;
            state.prune_empty_dynamic_queues();
            outcome
        }
        .instrument(span)
        .await
    }

    /// Whether the change alone would pass the driver's mergeability check.
    ///
    /// A driver failure counts as not ready.
    pub async fn is_ready(&self, change: &Change, event: &TriggerEvent) -> bool {
        match self.sources().can_merge(change, event, false).await {
            Ok(ready) => ready,
            Err(e) => {
                tracing::warn!(change = %change.key, "Unable to check readiness: {e}");
                false
            }
        }
    }

    /// Whether every member of a bundle can merge, re-checking with fresh
    /// driver data.
    pub async fn can_merge_bundle(&self, bundle: BundleId) -> bool {
        let members: Vec<(Arc<Change>, TriggerEvent)> = {
            let state = self.state.lock().await;
            let Some(found) = state.bundle(bundle) else {
                return false;
            };
            found
                .items()
                .iter()
                .filter_map(|id| state.item(*id))
                .map(|item| (Arc::clone(&item.change), item.event.clone()))
                .collect()
        };
        let sources = self.sources();
        for (change, event) in members {
            match sources.can_merge(&change, &event, true).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::info!(%bundle, change = %change.key, "Bundle member can not merge");
                    return false;
                }
                Err(e) => {
                    tracing::warn!(%bundle, change = %change.key, "Unable to check bundle member: {e}");
                    return false;
                }
            }
        }
        true
    }

    /// Copy of a queue item
    pub async fn item(&self, id: ItemId) -> Option<QueueItem> {
        self.state.lock().await.item(id).cloned()
    }

    /// The item holding `key`, if any
    pub async fn item_for_change(&self, key: &ChangeKey) -> Option<ItemId> {
        self.state.lock().await.item_for_change(key, None)
    }

    /// Zero-based position of the item in its queue
    pub async fn priority(&self, id: ItemId) -> Option<usize> {
        let state = self.state.lock().await;
        let item = state.item(id)?;
        state.queue(item.queue)?.priority(id)
    }

    /// Whether the item is inside its queue's window
    pub async fn is_actionable(&self, id: ItemId) -> bool {
        let state = self.state.lock().await;
        state
            .item(id)
            .and_then(|item| state.queue(item.queue))
            .is_some_and(|queue| queue.is_actionable(id))
    }

    /// Remove one item from its queue.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the item is not queued.
    pub async fn dequeue(&self, id: ItemId) -> Result<QueueItem> {
        let mut state = self.state.lock().await;
        let item = state
            .dequeue_item(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        state.prune_empty_dynamic_queues();
        Ok(item)
    }

    /// Remove an item together with every other member of its bundle.
    ///
    /// Returns the removed item ids, the requested item first.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the item is not queued.
    pub async fn remove_item(&self, id: ItemId) -> Result<Vec<ItemId>> {
        let mut state = self.state.lock().await;
        let removed = state
            .remove_item_with_bundle(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        state.prune_empty_dynamic_queues();
        tracing::info!(item = %id, removed = removed.len(), "Removed item and bundle peers");
        Ok(removed)
    }

    /// Mark an item as failing (or recovered).
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the item is not queued.
    pub async fn set_failing(&self, id: ItemId, failing: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        let item = state
            .item_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        item.failing = failing;
        Ok(())
    }

    /// Whether any bundle peer of the item in the same queue is failing
    pub async fn is_bundle_failing(&self, id: ItemId) -> bool {
        self.state.lock().await.is_bundle_failing(id)
    }

    /// Items whose failure dooms `id`, or `None` if there are none
    pub async fn failing_dependencies(&self, id: ItemId) -> Option<BTreeSet<ItemId>> {
        self.state.lock().await.failing_dependencies(id)
    }

    /// Nearest healthy item ahead of `id` in its queue
    pub async fn nearest_non_failing_item(&self, id: ItemId) -> Option<ItemId> {
        self.state.lock().await.nearest_non_failing_item(id)
    }

    /// Record a successful merge: grow the window and dequeue the item.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the item is not queued.
    pub async fn record_merge(&self, id: ItemId) -> Result<()> {
        let mut state = self.state.lock().await;
        let queue = state
            .item(id)
            .map(|item| item.queue)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        if let Some(queue) = state.queue_mut(queue) {
            queue.increase_window();
            tracing::debug!(%queue, window = queue.window(), "Increased window after merge");
        }
        state.dequeue_item(id);
        state.prune_empty_dynamic_queues();
        Ok(())
    }

    /// Record a gating failure: shrink the window and mark the item failing.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the item is not queued.
    pub async fn record_failure(&self, id: ItemId) -> Result<()> {
        let mut state = self.state.lock().await;
        let item = state
            .item_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        item.failing = true;
        let queue = item.queue;
        if let Some(queue) = state.queue_mut(queue) {
            queue.decrease_window();
            tracing::debug!(%queue, window = queue.window(), "Decreased window after failure");
        }
        Ok(())
    }

    /// Remove queued items holding older patchsets of `change`, together
    /// with their bundle peers.
    ///
    /// Does nothing unless `dequeue-on-new-patchset` is enabled.
    pub async fn remove_old_versions_of_change(&self, change: &Change) -> Vec<ItemId> {
        if !self.config.dequeue_on_new_patchset {
            return Vec::new();
        }
        self.remove_matching(|item| change.key.is_update_of(&item.change.key))
            .await
    }

    /// Remove every queued item of an abandoned change, any patchset, and
    /// their bundle peers.
    pub async fn remove_abandoned_change(&self, key: &ChangeKey) -> Vec<ItemId> {
        self.remove_matching(|item| {
            item.change.key.project == key.project && item.change.key.number == key.number
        })
        .await
    }

    async fn remove_matching(&self, matches: impl Fn(&QueueItem) -> bool) -> Vec<ItemId> {
        let mut state = self.state.lock().await;
        let targets: Vec<ItemId> = state
            .items()
            .filter(|item| matches(item))
            .map(|item| item.id)
            .collect();
        let mut removed = Vec::new();
        for id in targets {
            if let Some(cascade) = state.remove_item_with_bundle(id) {
                tracing::info!(item = %id, removed = cascade.len(), "Removing superseded item");
                removed.extend(cascade);
            }
        }
        state.prune_empty_dynamic_queues();
        removed
    }

    /// Branches of a project under this tenant's branch policy.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownConnection` or the driver's error.
    pub async fn project_branches(&self, project: &Project) -> Result<Vec<String>> {
        let connection = self.connections.for_project(project)?;
        connection
            .branch_cache()
            .project_branches(&project.name, self.config.exclude_unprotected_branches)
            .await
    }

    /// Wipe the branch caches of every connection.
    pub async fn clear_cache(&self) {
        for connection in self.connections.iter() {
            connection.branch_cache().clear_all().await;
        }
    }

    /// Wipe the branch cache of one project.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownConnection` if the project's connection is not registered.
    pub async fn clear_project_cache(&self, project: &Project) -> Result<()> {
        self.connections
            .for_project(project)?
            .branch_cache()
            .clear_project(&project.name)
            .await;
        Ok(())
    }

    /// Route a branch ref update to the project's branch cache.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownConnection` if the project's connection is not registered.
    pub async fn on_branch_ref_event(
        &self,
        project: &Project,
        branch: &str,
        old_rev: &str,
        new_rev: &str,
        event: Option<&TriggerEvent>,
    ) -> Result<BranchRefChange> {
        let connection = self.connections.for_project(project)?;
        Ok(connection
            .branch_cache()
            .on_branch_ref_event(&project.name, branch, old_rev, new_rev, event)
            .await)
    }

    /// Check a branch's protection against the protected-branch cache.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownConnection` if the project's connection is not registered.
    pub async fn check_protection_drift(
        &self,
        project: &Project,
        branch: &str,
        known_protected: Option<bool>,
        event: Option<&TriggerEvent>,
    ) -> Result<bool> {
        let connection = self.connections.for_project(project)?;
        Ok(connection
            .branch_cache()
            .check_protection_drift(&project.name, branch, known_protected, event)
            .await)
    }

    /// Serializable view of every queue
    pub async fn snapshot(&self) -> Vec<QueueSnapshot> {
        self.state.lock().await.snapshot()
    }

    /// Changes in the named queue, head first
    pub async fn queue_changes(&self, name: &str) -> Option<Vec<ChangeKey>> {
        let state = self.state.lock().await;
        let queue = state.queues().iter().find(|queue| queue.name() == name)?;
        Some(
            queue
                .items()
                .iter()
                .filter_map(|id| state.item(*id))
                .map(|item| item.change.key.clone())
                .collect(),
        )
    }

    /// Pipeline status as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if rendering fails.
    pub async fn status_json(&self) -> Result<String> {
        let status = PipelineStatus {
            pipeline: &self.config.name,
            tenant: &self.config.tenant,
            queues: self.snapshot().await,
        };
        Ok(serde_json::to_string_pretty(&status)?)
    }
}

#[derive(Serialize)]
struct PipelineStatus<'a> {
    pipeline: &'a str,
    tenant: &'a str,
    queues: Vec<QueueSnapshot>,
}
