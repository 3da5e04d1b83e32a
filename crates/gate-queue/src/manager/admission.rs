//! The recursive admission walk.
//!
//! Admitting a change first admits everything it needs (ahead), then the
//! change itself, then whatever in the same queue was waiting on it
//! (behind). Dependents are only looked for once no change is mid-way
//! through resolving its prerequisites, so a dependent never overtakes a
//! prerequisite that is still being resolved. The walk is serialized by the
//! pipeline lock; driver calls are its only suspension points.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use futures::future::{BoxFuture, FutureExt};

use super::{
    outcome::{Admission, RejectReason},
    state::PipelineState,
};
use crate::{
    change::{Change, ChangeKey, TriggerEvent},
    queue::{ItemId, QueueId},
    resolver::{DependencyResolver, Prerequisites},
    source::SourceContext,
    Result,
};

/// Whether the changes ahead of a change are in place.
enum Ahead {
    Ready,
    Blocked(RejectReason),
}

pub(super) struct AdmissionWalk<'a> {
    state: &'a mut PipelineState,
    sources: SourceContext<'a>,
    event: &'a TriggerEvent,
    resolver: DependencyResolver,
    /// Changes whose prerequisites were visited during this walk
    history: Vec<ChangeKey>,
    /// Changes whose prerequisites are being resolved right now
    path: Vec<ChangeKey>,
    /// Items created by this walk, oldest first
    admitted: Vec<ItemId>,
    /// Changes refused during this walk
    rejected: HashMap<ChangeKey, RejectReason>,
    /// Queued changes whose dependents have not been looked for yet
    behind: VecDeque<(Arc<Change>, QueueId)>,
}

impl<'a> AdmissionWalk<'a> {
    pub(super) fn new(
        state: &'a mut PipelineState,
        sources: SourceContext<'a>,
        event: &'a TriggerEvent,
        max_dependencies: Option<usize>,
    ) -> Self {
        Self {
            state,
            sources,
            event,
            resolver: DependencyResolver::new(max_dependencies),
            history: Vec::new(),
            path: Vec::new(),
            admitted: Vec::new(),
            rejected: HashMap::new(),
            behind: VecDeque::new(),
        }
    }

    /// Admit `change`; on rejection every item created on its behalf is
    /// removed again.
    pub(super) fn add_change(&mut self, change: Arc<Change>) -> BoxFuture<'_, Admission> {
        async move {
            let mark = self.admitted.len();
            let outcome = match self.try_add_change(&change).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(change = %change.key, "Source unavailable, not enqueuing: {e}");
                    Admission::Rejected {
                        reason: RejectReason::SourceUnavailable {
                            change: change.key.clone(),
                            message: e.to_string(),
                        },
                    }
                }
            };
            if let Admission::Rejected { reason } = &outcome {
                tracing::info!(change = %change.key, %reason, "Change not enqueued");
                self.roll_back(mark);
                self.rejected.insert(change.key.clone(), reason.clone());
            }
            outcome
        }
        .boxed()
    }

    async fn try_add_change(&mut self, change: &Arc<Change>) -> Result<Admission> {
        tracing::debug!(change = %change.key, "Considering adding change");
        if self.state.is_change_in_pipeline(&change.key) {
            tracing::debug!(change = %change.key, "Change is already in pipeline, ignoring");
            return Ok(Admission::AlreadyQueued);
        }
        if !self.sources.can_merge(change, self.event, false).await? {
            tracing::debug!(change = %change.key, "Change can not merge, ignoring");
            return Ok(Admission::Rejected {
                reason: RejectReason::NotMergeable {
                    change: change.key.clone(),
                },
            });
        }

        let queue = self.state.get_or_create_queue(change.project());

        if let Ahead::Blocked(reason) = self.enqueue_ahead(change).await? {
            tracing::debug!(change = %change.key, "Failed to enqueue changes ahead of change");
            return Ok(Admission::Rejected { reason });
        }
        if self.state.is_change_in_queue(&change.key, queue) {
            tracing::debug!(change = %change.key, "Change is already in queue, ignoring");
            return Ok(Admission::AlreadyQueued);
        }

        let cycle = if change.supports_dependencies() {
            self.resolver.detect_cycle(&change.key)
        } else {
            Vec::new()
        };
        let allows_cycles = self
            .state
            .queue(queue)
            .is_some_and(|q| q.allows_circular_dependencies());
        if !cycle.is_empty() && !allows_cycles {
            tracing::info!(change = %change.key, "Queue does not allow circular dependencies");
            return Ok(Admission::Rejected {
                reason: RejectReason::CycleNotAllowed {
                    change: change.key.clone(),
                },
            });
        }

        tracing::info!(change = %change.key, %queue, "Adding change to queue");
        let needs = self.resolver.needs_for(change);
        let item = self
            .state
            .enqueue_change(Arc::clone(change), queue, self.event.clone(), needs);
        self.admitted.push(item);
        self.state.update_bundle(item, queue, &cycle);

        if cycle.is_empty() {
            self.behind.push_back((Arc::clone(change), queue));
        } else if cycle.iter().all(|key| self.state.is_change_in_queue(key, queue)) {
            tracing::debug!(change = %change.key, "Cycle is complete, enqueuing changes behind");
            let members: Vec<Arc<Change>> = cycle
                .iter()
                .filter_map(|key| self.state.item_for_change(key, Some(queue)))
                .filter_map(|id| self.state.item(id))
                .map(|queued| Arc::clone(&queued.change))
                .collect();
            self.behind.extend(members.into_iter().map(|member| (member, queue)));
        }
        if self.path.is_empty() {
            self.enqueue_pending_behind().await;
        }

        Ok(Admission::Admitted { item })
    }

    async fn enqueue_ahead(&mut self, change: &Change) -> Result<Ahead> {
        if !change.supports_dependencies() {
            return Ok(Ahead::Ready);
        }
        self.history.push(change.key.clone());
        self.path.push(change.key.clone());
        let ahead = self.enqueue_needed(change).await;
        self.path.pop();
        ahead
    }

    async fn enqueue_needed(&mut self, change: &Change) -> Result<Ahead> {
        let needed = match self
            .resolver
            .resolve_prerequisites(change, &*self.state, self.sources, self.event)
            .await?
        {
            Prerequisites::Satisfied => return Ok(Ahead::Ready),
            Prerequisites::Blocked(reason) => return Ok(Ahead::Blocked(reason)),
            Prerequisites::Needed(needed) => needed,
        };
        tracing::debug!(
            change = %change.key,
            needed = ?needed.iter().map(|c| c.key.to_string()).collect::<Vec<_>>(),
            "Changes must be merged ahead of change"
        );
        for needed_change in needed {
            if let Some(reason) = self.rejected.get(&needed_change.key) {
                return Ok(Ahead::Blocked(reason.clone()));
            }
            if !DependencyResolver::should_descend(change, &needed_change.key, &self.history, &self.path) {
                tracing::debug!(needed = %needed_change.key, "Skipping change already visited in this walk");
                continue;
            }
            if let Admission::Rejected { reason } = self.add_change(needed_change).await {
                return Ok(Ahead::Blocked(reason));
            }
        }
        Ok(Ahead::Ready)
    }

    async fn enqueue_pending_behind(&mut self) {
        while let Some((change, queue)) = self.behind.pop_front() {
            if self.state.is_change_in_queue(&change.key, queue) {
                self.enqueue_behind(&change, queue).await;
            }
        }
    }

    async fn enqueue_behind(&mut self, change: &Change, queue: QueueId) {
        if !change.supports_dependencies() {
            tracing::debug!(change = %change.key, "Change does not support dependencies");
            return;
        }
        let Some(target) = self.state.queue(queue) else {
            return;
        };
        let dependents = match self
            .resolver
            .find_dependents(change, target, self.sources, self.event)
            .await
        {
            Ok(dependents) => dependents,
            Err(e) => {
                tracing::warn!(change = %change.key, "Unable to find changes behind change: {e}");
                return;
            }
        };

        let mut to_enqueue = Vec::new();
        for other in dependents {
            if self.rejected.contains_key(&other.key) {
                continue;
            }
            if self.state.queue_for_project(other.project()) != Some(queue) {
                tracing::debug!(other = %other.key, "Change can not be enqueued in the target queue");
                continue;
            }
            match self.sources.can_merge(&other, self.event, false).await {
                Ok(true) => to_enqueue.push(other),
                Ok(false) => tracing::debug!(other = %other.key, "Change needs change but can not merge"),
                Err(e) => tracing::warn!(other = %other.key, "Unable to check mergeability: {e}"),
            }
        }

        if to_enqueue.is_empty() {
            tracing::debug!(change = %change.key, "No changes need change");
        }
        for other in to_enqueue {
            let key = other.key.clone();
            let outcome = self.add_change(other).await;
            tracing::debug!(change = %key, ?outcome, "Enqueued change behind");
        }
    }

    /// Remove items admitted after `mark`, newest first.
    ///
    /// Rolled back changes are forgotten by the visited guard so a later
    /// dependent in the same walk resolves them again.
    fn roll_back(&mut self, mark: usize) {
        while self.admitted.len() > mark {
            let Some(id) = self.admitted.pop() else {
                break;
            };
            if let Some(item) = self.state.dequeue_item(id) {
                tracing::info!(item = %item, "Rolled back item admitted for rejected change");
                self.history.retain(|key| *key != item.change.key);
            }
        }
    }
}
