//! Queues, items and bundles of one pipeline.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use serde::Serialize;

use crate::{
    change::{Change, ChangeKey, Project, TriggerEvent},
    config::{PipelineConfig, WindowConfig},
    queue::{Bundle, BundleId, ChangeQueue, ItemId, QueueId, QueueItem},
};

/// Mutable state of one pipeline, guarded by the manager's lock.
#[derive(Debug)]
pub struct PipelineState {
    queues: Vec<ChangeQueue>,
    items: HashMap<ItemId, QueueItem>,
    bundles: HashMap<BundleId, Bundle>,
    window_policy: WindowConfig,
    next_queue: u64,
    next_item: u64,
    next_bundle: u64,
}

impl PipelineState {
    /// Create the shared queues named in `config`.
    #[must_use]
    pub fn new(config: &PipelineConfig) -> Self {
        let mut state = Self {
            queues: Vec::new(),
            items: HashMap::new(),
            bundles: HashMap::new(),
            window_policy: config.window.clone(),
            next_queue: 0,
            next_item: 0,
            next_bundle: 0,
        };
        for shared in &config.queues {
            let id = state.allocate_queue_id();
            let queue = ChangeQueue::new(id, shared.name.clone(), &config.window, false)
                .with_member_projects(shared.projects.iter().cloned())
                .with_circular_dependencies(shared.allow_circular_dependencies);
            state.queues.push(queue);
        }
        state
    }

    fn allocate_queue_id(&mut self) -> QueueId {
        self.next_queue += 1;
        QueueId::new(self.next_queue)
    }

    /// All queues in creation order
    #[must_use]
    pub fn queues(&self) -> &[ChangeQueue] {
        &self.queues
    }

    #[must_use]
    pub fn queue(&self, id: QueueId) -> Option<&ChangeQueue> {
        self.queues.iter().find(|queue| queue.id() == id)
    }

    pub(crate) fn queue_mut(&mut self, id: QueueId) -> Option<&mut ChangeQueue> {
        self.queues.iter_mut().find(|queue| queue.id() == id)
    }

    /// The queue changes of `project` are routed to, without creating one.
    #[must_use]
    pub fn queue_for_project(&self, project: &Project) -> Option<QueueId> {
        self.queues
            .iter()
            .find(|queue| queue.matches(project))
            .map(ChangeQueue::id)
    }

    /// The queue for `project`, creating a dynamic one named after the
    /// project if it is not configured into a shared queue.
    pub(crate) fn get_or_create_queue(&mut self, project: &Project) -> QueueId {
        let id = match self.queue_for_project(project) {
            Some(id) => id,
            None => {
                let id = self.allocate_queue_id();
                let queue = ChangeQueue::new(id, project.name.clone(), &self.window_policy, true);
                tracing::debug!(queue = %queue, project = %project, "Dynamically created queue");
                self.queues.push(queue);
                id
            }
        };
        if let Some(queue) = self.queue_mut(id) {
            queue.add_project(project);
        }
        id
    }

    #[must_use]
    pub fn item(&self, id: ItemId) -> Option<&QueueItem> {
        self.items.get(&id)
    }

    pub(crate) fn item_mut(&mut self, id: ItemId) -> Option<&mut QueueItem> {
        self.items.get_mut(&id)
    }

    /// Every item in the pipeline, in no particular order
    pub fn items(&self) -> impl Iterator<Item = &QueueItem> {
        self.items.values()
    }

    #[must_use]
    pub fn bundle(&self, id: BundleId) -> Option<&Bundle> {
        self.bundles.get(&id)
    }

    /// The item holding `key`, optionally restricted to one queue.
    #[must_use]
    pub fn item_for_change(&self, key: &ChangeKey, queue: Option<QueueId>) -> Option<ItemId> {
        self.items
            .values()
            .find(|item| item.change.key == *key && queue.map_or(true, |q| item.queue == q))
            .map(|item| item.id)
    }

    /// Whether an item for `key` exists in any queue.
    #[must_use]
    pub fn is_change_in_pipeline(&self, key: &ChangeKey) -> bool {
        self.items.values().any(|item| item.change.key == *key)
    }

    #[must_use]
    pub fn is_change_in_queue(&self, key: &ChangeKey, queue: QueueId) -> bool {
        self.item_for_change(key, Some(queue)).is_some()
    }

    /// Append a new item for `change` at the tail of `queue`.
    pub(crate) fn enqueue_change(
        &mut self,
        change: Arc<Change>,
        queue: QueueId,
        event: TriggerEvent,
        needs: Vec<ChangeKey>,
    ) -> ItemId {
        self.next_item += 1;
        let id = ItemId::new(self.next_item);
        if let Some(target) = self.queue_mut(queue) {
            target.enqueue(id);
        }
        self.items.insert(id, QueueItem::new(id, change, queue, event, needs));
        id
    }

    /// Put `item` into the bundle of its cycle.
    ///
    /// The first cycle member to be queued opens a bundle; later members
    /// join the bundle of any peer already in the queue.
    pub(crate) fn update_bundle(&mut self, item: ItemId, queue: QueueId, cycle: &[ChangeKey]) {
        if cycle.is_empty() {
            return;
        }
        let Some(own_key) = self.item(item).map(|i| i.change.key.clone()) else {
            return;
        };
        let peer_bundle = cycle
            .iter()
            .filter(|key| **key != own_key)
            .filter_map(|key| self.item_for_change(key, Some(queue)))
            .find_map(|peer| self.item(peer).and_then(|i| i.bundle));
        let bundle_id = peer_bundle.unwrap_or_else(|| {
            self.next_bundle += 1;
            let id = BundleId::new(self.next_bundle);
            self.bundles.insert(id, Bundle::new(id));
            id
        });
        if let Some(bundle) = self.bundles.get_mut(&bundle_id) {
            bundle.add_item(item);
        }
        if let Some(queued) = self.item_mut(item) {
            queued.bundle = Some(bundle_id);
        }
        tracing::debug!(%item, bundle = %bundle_id, "Added item to bundle");
    }

    /// Remove an item from its queue and bundle.
    pub(crate) fn dequeue_item(&mut self, id: ItemId) -> Option<QueueItem> {
        let item = self.items.remove(&id)?;
        if let Some(queue) = self.queue_mut(item.queue) {
            queue.dequeue(id);
        }
        if let Some(bundle_id) = item.bundle {
            let emptied = self.bundles.get_mut(&bundle_id).is_some_and(|bundle| {
                bundle.remove_item(id);
                bundle.is_empty()
            });
            if emptied {
                self.bundles.remove(&bundle_id);
            }
        }
        tracing::debug!(item = %item, "Removed item from queue");
        Some(item)
    }

    /// Remove an item and every other member of its bundle.
    ///
    /// Returns the removed ids, `id` first, or `None` if `id` is not queued.
    pub(crate) fn remove_item_with_bundle(&mut self, id: ItemId) -> Option<Vec<ItemId>> {
        let peers: Vec<ItemId> = self
            .item(id)?
            .bundle
            .and_then(|bundle| self.bundle(bundle))
            .map(|bundle| bundle.items().to_vec())
            .unwrap_or_default();
        self.dequeue_item(id)?;
        let mut removed = vec![id];
        for peer in peers {
            if peer != id && self.dequeue_item(peer).is_some() {
                removed.push(peer);
            }
        }
        Some(removed)
    }

    /// Drop dynamic queues that no longer hold any item.
    pub(crate) fn prune_empty_dynamic_queues(&mut self) {
        self.queues.retain(|queue| {
            let keep = !queue.is_dynamic() || !queue.is_empty();
            if !keep {
                tracing::debug!(queue = %queue, "Removing empty dynamic queue");
            }
            keep
        });
    }

    /// Whether any member of the item's bundle in the same queue is failing.
    #[must_use]
    pub fn is_bundle_failing(&self, id: ItemId) -> bool {
        let Some(item) = self.item(id) else {
            return false;
        };
        let Some(bundle) = item.bundle.and_then(|b| self.bundle(b)) else {
            return false;
        };
        bundle
            .items()
            .iter()
            .filter_map(|member| self.item(*member))
            .any(|member| member.queue == item.queue && member.failing)
    }

    /// Items whose failure dooms `id`: failing prerequisites, and every other
    /// bundle member when the bundle is failing. `None` if there are none.
    #[must_use]
    pub fn failing_dependencies(&self, id: ItemId) -> Option<BTreeSet<ItemId>> {
        let item = self.item(id)?;
        let mut failing: BTreeSet<ItemId> = item
            .needs
            .iter()
            .filter_map(|needed| self.item_for_change(needed, None))
            .filter(|needed| self.item(*needed).is_some_and(|i| i.failing))
            .collect();
        if self.is_bundle_failing(id) {
            if let Some(bundle) = item.bundle.and_then(|b| self.bundle(b)) {
                failing.extend(bundle.items().iter().copied().filter(|member| *member != id));
            }
        }
        (!failing.is_empty()).then_some(failing)
    }

    /// Nearest item ahead of `id` in its queue that is not failing and has
    /// no failing dependencies.
    #[must_use]
    pub fn nearest_non_failing_item(&self, id: ItemId) -> Option<ItemId> {
        let item = self.item(id)?;
        let ahead = self.queue(item.queue)?.items_ahead(id)?;
        ahead.iter().rev().copied().find(|candidate| {
            self.item(*candidate).is_some_and(|c| !c.failing)
                && self.failing_dependencies(*candidate).is_none()
        })
    }

    /// Serializable view of every queue, head first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<QueueSnapshot> {
        self.queues
            .iter()
            .map(|queue| QueueSnapshot {
                name: queue.name().to_string(),
                dynamic: queue.is_dynamic(),
                window: queue.window(),
                window_floor: queue.window_floor(),
                items: queue
                    .items()
                    .iter()
                    .filter_map(|id| self.item(*id))
                    .map(|item| ItemSnapshot {
                        id: item.id,
                        change: item.change.key.to_string(),
                        bundle: item.bundle,
                        failing: item.failing,
                        active: queue.is_actionable(item.id),
                    })
                    .collect(),
            })
            .collect()
    }
}

/// Status view of one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    pub name: String,
    pub dynamic: bool,
    pub window: u32,
    pub window_floor: u32,
    pub items: Vec<ItemSnapshot>,
}

/// Status view of one queue item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemSnapshot {
    pub id: ItemId,
    pub change: String,
    pub bundle: Option<BundleId>,
    pub failing: bool,
    /// Inside the queue's window
    pub active: bool,
}
