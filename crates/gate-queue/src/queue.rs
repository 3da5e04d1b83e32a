//! Change queues, queue items and bundles
//!
//! A [`ChangeQueue`] is one admission lane. Items are appended at the tail
//! in dependency order and only ever leave by dequeue; there is no
//! reordering operation. The window is inspired by TCP windows: it limits
//! how many items at the head of the queue are actionable, grows after a
//! merge and shrinks after a gating failure, never below the floor.

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    change::{Change, ChangeKey, Project, TriggerEvent},
    config::{WindowConfig, WindowType},
};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(u64);

        impl $name {
            /// Create an id from its raw value
            #[must_use]
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            /// The raw value
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }
    };
}

id_type!(
    /// Identifies a change queue within a pipeline
    QueueId,
    "queue"
);
id_type!(
    /// Identifies a queue item within a pipeline
    ItemId,
    "item"
);
id_type!(
    /// Identifies a bundle within a pipeline
    BundleId,
    "bundle"
);

/// The position of one change in a change queue.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: ItemId,
    pub change: Arc<Change>,
    /// Queue the item currently belongs to
    pub queue: QueueId,
    /// Bundle of cycle peers, if the change is part of a dependency cycle
    pub bundle: Option<BundleId>,
    /// Set by the build subsystem when the item's builds are failing
    pub failing: bool,
    /// Prerequisites resolved when the item was admitted, including
    /// refreshed commit dependencies
    pub needs: Vec<ChangeKey>,
    /// Trigger that admitted the item
    pub event: TriggerEvent,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueItem {
    /// Create a non-failing item
    #[must_use]
    pub fn new(
        id: ItemId,
        change: Arc<Change>,
        queue: QueueId,
        event: TriggerEvent,
        needs: Vec<ChangeKey>,
    ) -> Self {
        Self {
            id,
            change,
            queue,
            bundle: None,
            failing: false,
            needs,
            event,
            enqueued_at: Utc::now(),
        }
    }
}

impl fmt::Display for QueueItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<QueueItem {} for {}>", self.id, self.change.key)
    }
}

/// Items whose changes form a dependency cycle; merged only as a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    pub id: BundleId,
    items: Vec<ItemId>,
}

impl Bundle {
    /// Create an empty bundle
    #[must_use]
    pub const fn new(id: BundleId) -> Self {
        Self {
            id,
            items: Vec::new(),
        }
    }

    /// Add an item (idempotent)
    pub fn add_item(&mut self, item: ItemId) {
        if !self.items.contains(&item) {
            self.items.push(item);
        }
    }

    /// Remove an item, returning whether it was a member
    pub fn remove_item(&mut self, item: ItemId) -> bool {
        let before = self.items.len();
        self.items.retain(|i| *i != item);
        self.items.len() != before
    }

    /// Member items in admission order
    #[must_use]
    pub fn items(&self) -> &[ItemId] {
        &self.items
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// An ordered, windowed admission lane.
#[derive(Debug, Clone)]
pub struct ChangeQueue {
    id: QueueId,
    name: String,
    /// Project names configured into this queue
    member_projects: Vec<String>,
    /// Projects whose changes have been routed here
    projects: Vec<Project>,
    items: Vec<ItemId>,
    window: u32,
    window_floor: u32,
    window_increase_type: WindowType,
    window_increase_factor: u32,
    window_decrease_type: WindowType,
    window_decrease_factor: u32,
    dynamic: bool,
    allow_circular_dependencies: bool,
}

impl ChangeQueue {
    /// Create a queue with the given window policy.
    ///
    /// The policy is taken as is; [`crate::PipelineConfig::validate`] is what
    /// guarantees a nonzero floor and a window no smaller than it.
    #[must_use]
    pub fn new(id: QueueId, name: impl Into<String>, policy: &WindowConfig, dynamic: bool) -> Self {
        Self {
            id,
            name: name.into(),
            member_projects: Vec::new(),
            projects: Vec::new(),
            items: Vec::new(),
            window: policy.window,
            window_floor: policy.window_floor,
            window_increase_type: policy.window_increase_type,
            window_increase_factor: policy.window_increase_factor,
            window_decrease_type: policy.window_decrease_type,
            window_decrease_factor: policy.window_decrease_factor,
            dynamic,
            allow_circular_dependencies: false,
        }
    }

    /// Configure which projects are gated by this queue
    #[must_use]
    pub fn with_member_projects(mut self, projects: impl IntoIterator<Item = String>) -> Self {
        self.member_projects = projects.into_iter().collect();
        self
    }

    /// Allow dependency cycles to be admitted as bundles
    #[must_use]
    pub const fn with_circular_dependencies(mut self, allow: bool) -> Self {
        self.allow_circular_dependencies = allow;
        self
    }

    #[must_use]
    pub const fn id(&self) -> QueueId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    #[must_use]
    pub const fn allows_circular_dependencies(&self) -> bool {
        self.allow_circular_dependencies
    }

    /// Current window; 0 means unlimited
    #[must_use]
    pub const fn window(&self) -> u32 {
        self.window
    }

    #[must_use]
    pub const fn window_floor(&self) -> u32 {
        self.window_floor
    }

    /// Whether changes of `project` are routed to this queue
    #[must_use]
    pub fn matches(&self, project: &Project) -> bool {
        self.member_projects.iter().any(|p| *p == project.name)
            || self.projects.contains(project)
    }

    /// Record a project whose changes are routed here
    pub fn add_project(&mut self, project: &Project) {
        if !self.projects.contains(project) {
            self.projects.push(project.clone());
        }
    }

    /// Projects seen in this queue, used to find dependents across sources
    #[must_use]
    pub fn projects(&self) -> &[Project] {
        &self.projects
    }

    /// Append an item at the tail
    pub fn enqueue(&mut self, item: ItemId) {
        self.items.push(item);
    }

    /// Remove an item, returning whether it was present
    pub fn dequeue(&mut self, item: ItemId) -> bool {
        self.items
            .iter()
            .position(|i| *i == item)
            .map(|index| self.items.remove(index))
            .is_some()
    }

    /// Zero-based position of the item; lower is higher priority
    #[must_use]
    pub fn priority(&self, item: ItemId) -> Option<usize> {
        self.items.iter().position(|i| *i == item)
    }

    /// Items ahead of `item`, nearest last
    #[must_use]
    pub fn items_ahead(&self, item: ItemId) -> Option<&[ItemId]> {
        self.priority(item).map(|index| &self.items[..index])
    }

    #[must_use]
    pub fn items(&self) -> &[ItemId] {
        &self.items
    }

    #[must_use]
    pub fn contains(&self, item: ItemId) -> bool {
        self.items.contains(&item)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether the item is inside the active window
    #[must_use]
    pub fn is_actionable(&self, item: ItemId) -> bool {
        match self.priority(item) {
            None => false,
            Some(_) if self.window == 0 => true,
            Some(index) => index < self.window as usize,
        }
    }

    /// Grow the window after a successful merge
    pub fn increase_window(&mut self) {
        if self.window == 0 {
            return;
        }
        let grown = match self.window_increase_type {
            WindowType::Linear => self.window.saturating_add(self.window_increase_factor),
            WindowType::Exponential => self.window.saturating_mul(self.window_increase_factor),
        };
        self.window = grown.max(self.window_floor);
    }

    /// Shrink the window after a gating failure
    pub fn decrease_window(&mut self) {
        if self.window == 0 {
            return;
        }
        let shrunk = match self.window_decrease_type {
            WindowType::Linear => self.window.saturating_sub(self.window_decrease_factor),
            WindowType::Exponential => self
                .window
                .checked_div(self.window_decrease_factor)
                .unwrap_or(self.window),
        };
        self.window = shrunk.max(self.window_floor);
    }
}

impl fmt::Display for ChangeQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<ChangeQueue {}>", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(window: u32, floor: u32) -> WindowConfig {
        WindowConfig {
            window,
            window_floor: floor,
            ..WindowConfig::default()
        }
    }

    fn queue_with(items: &[u64]) -> ChangeQueue {
        let mut queue = ChangeQueue::new(QueueId::new(1), "org/a", &policy(2, 1), false);
        for raw in items {
            queue.enqueue(ItemId::new(*raw));
        }
        queue
    }

    #[test]
    fn test_enqueue_appends_and_priority_is_position() {
        let queue = queue_with(&[10, 11, 12]);
        assert_eq!(queue.priority(ItemId::new(10)), Some(0));
        assert_eq!(queue.priority(ItemId::new(12)), Some(2));
        assert_eq!(queue.priority(ItemId::new(99)), None);
    }

    #[test]
    fn test_dequeue_shifts_priorities() {
        let mut queue = queue_with(&[10, 11, 12]);
        assert!(queue.dequeue(ItemId::new(10)));
        assert!(!queue.dequeue(ItemId::new(10)));
        assert_eq!(queue.priority(ItemId::new(11)), Some(0));
        assert_eq!(queue.items_ahead(ItemId::new(12)), Some(&[ItemId::new(11)][..]));
    }

    #[test]
    fn test_actionable_respects_window() {
        let queue = queue_with(&[10, 11, 12]);
        assert!(queue.is_actionable(ItemId::new(10)));
        assert!(queue.is_actionable(ItemId::new(11)));
        assert!(!queue.is_actionable(ItemId::new(12)));
    }

    #[test]
    fn test_unlimited_window_is_always_actionable_and_fixed() {
        let mut queue = ChangeQueue::new(QueueId::new(1), "q", &policy(0, 3), true);
        queue.enqueue(ItemId::new(1));
        queue.decrease_window();
        queue.increase_window();
        assert_eq!(queue.window(), 0);
        assert!(queue.is_actionable(ItemId::new(1)));
    }

    #[test]
    fn test_window_grows_linearly_and_halves() {
        let mut queue = ChangeQueue::new(QueueId::new(1), "q", &policy(10, 3), false);
        queue.increase_window();
        assert_eq!(queue.window(), 11);
        queue.decrease_window();
        assert_eq!(queue.window(), 5);
        queue.decrease_window();
        assert_eq!(queue.window(), 3);
        queue.decrease_window();
        assert_eq!(queue.window(), 3);
    }

    #[test]
    fn test_linear_decrease_stops_at_floor() {
        let mut config = policy(5, 2);
        config.window_decrease_type = WindowType::Linear;
        config.window_decrease_factor = 10;
        let mut queue = ChangeQueue::new(QueueId::new(1), "q", &config, false);
        queue.decrease_window();
        assert_eq!(queue.window(), 2);
    }

    #[test]
    fn test_new_takes_policy_as_given() {
        let queue = ChangeQueue::new(QueueId::new(1), "q", &policy(7, 4), false);
        assert_eq!(queue.window(), 7);
        assert_eq!(queue.window_floor(), 4);
    }

    #[test]
    fn test_matches_member_and_seen_projects() {
        let mut queue = ChangeQueue::new(QueueId::new(1), "shared", &policy(2, 1), false)
            .with_member_projects(vec!["org/a".to_string()]);
        let a = Project::new("gerrit", "org/a");
        let b = Project::new("github", "org/b");
        assert!(queue.matches(&a));
        assert!(!queue.matches(&b));
        queue.add_project(&b);
        assert!(queue.matches(&b));
    }

    #[test]
    fn test_bundle_membership_is_idempotent() {
        let mut bundle = Bundle::new(BundleId::new(1));
        bundle.add_item(ItemId::new(1));
        bundle.add_item(ItemId::new(1));
        bundle.add_item(ItemId::new(2));
        assert_eq!(bundle.items().len(), 2);
        assert!(bundle.remove_item(ItemId::new(1)));
        assert!(!bundle.is_empty());
        assert!(bundle.remove_item(ItemId::new(2)));
        assert!(bundle.is_empty());
    }
}
