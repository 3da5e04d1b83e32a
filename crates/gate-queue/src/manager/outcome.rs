//! Admission outcomes.

use serde::Serialize;
use thiserror::Error;

use crate::{change::ChangeKey, queue::ItemId};

/// Why an admission attempt was refused.
///
/// Every reason is local to one attempt; the change is reconsidered on its
/// next trigger.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    /// The change itself does not pass the host's submit policy.
    #[error("change {change} can not merge")]
    NotMergeable { change: ChangeKey },

    /// A prerequisite is no longer the current patchset.
    #[error("change {change} needs {needed}, which is not the current patchset")]
    StaleDependency { change: ChangeKey, needed: ChangeKey },

    /// A prerequisite is routed to a different queue.
    #[error("change {change} needs {needed}, which does not share a change queue")]
    CrossQueueDependency { change: ChangeKey, needed: ChangeKey },

    /// A prerequisite does not pass the host's submit policy.
    #[error("change {change} needs {needed}, which can not merge")]
    UnmergeablePrerequisite { change: ChangeKey, needed: ChangeKey },

    /// A prerequisite could not be found by its source.
    #[error("change {change} needs {needed}, which could not be found")]
    DependencyNotFound { change: ChangeKey, needed: ChangeKey },

    /// The dependency graph grew beyond the configured limit.
    #[error("dependency graph of change {change} exceeds {limit} changes")]
    TooManyDependencies { change: ChangeKey, limit: usize },

    /// The change is part of a cycle but its queue does not allow cycles.
    #[error("change {change} is part of a dependency cycle that is not allowed")]
    CycleNotAllowed { change: ChangeKey },

    /// A driver call failed or timed out; treated as blocked.
    #[error("source unavailable while admitting {change}: {message}")]
    SourceUnavailable { change: ChangeKey, message: String },
}

impl RejectReason {
    /// The change whose admission was refused.
    #[must_use]
    pub const fn change(&self) -> &ChangeKey {
        match self {
            Self::NotMergeable { change }
            | Self::StaleDependency { change, .. }
            | Self::CrossQueueDependency { change, .. }
            | Self::UnmergeablePrerequisite { change, .. }
            | Self::DependencyNotFound { change, .. }
            | Self::TooManyDependencies { change, .. }
            | Self::CycleNotAllowed { change }
            | Self::SourceUnavailable { change, .. } => change,
        }
    }
}

/// Result of [`crate::GateQueueManager::add_change`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Admission {
    /// A new queue item was created
    Admitted { item: ItemId },
    /// The change already has an item in the pipeline or queue
    AlreadyQueued,
    /// The change was not admitted; nothing it pulled in was kept
    Rejected { reason: RejectReason },
}

impl Admission {
    /// Whether the change is in the pipeline after this call.
    #[must_use]
    pub const fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted { .. } | Self::AlreadyQueued)
    }

    /// The new item, if one was created.
    #[must_use]
    pub const fn item(&self) -> Option<ItemId> {
        match self {
            Self::Admitted { item } => Some(*item),
            _ => None,
        }
    }

    /// The rejection reason, if any.
    #[must_use]
    pub const fn rejection(&self) -> Option<&RejectReason> {
        match self {
            Self::Rejected { reason } => Some(reason),
            _ => None,
        }
    }
}
