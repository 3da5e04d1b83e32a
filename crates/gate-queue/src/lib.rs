//! gate-queue - Dependency-aware admission for dependent (gate) pipelines
//!
//! This crate provides:
//! - Change queues with a TCP-like window
//! - Recursive admission of changes with their prerequisites and dependents
//! - Dependency cycle detection and bundles
//! - A per-connection branch protection cache
//!
//! Source drivers plug in through the [`Source`] trait.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod branch_cache;
pub mod change;
pub mod config;
pub mod error;
pub mod manager;
pub mod queue;
pub mod resolver;
pub mod source;

pub use branch_cache::{is_null_revision, BranchProtectionCache, BranchRefChange};
pub use change::{Change, ChangeKey, Dependencies, DependencyLinks, Project, TriggerEvent};
pub use config::{PipelineConfig, SharedQueueConfig, WindowConfig, WindowType};
pub use error::{Error, Result};
pub use manager::{Admission, GateQueueManager, ItemSnapshot, QueueSnapshot, RejectReason};
pub use queue::{Bundle, BundleId, ChangeQueue, ItemId, QueueId, QueueItem};
pub use resolver::{DependencyGraph, DependencyResolver, Prerequisites};
pub use source::{Connection, Connections, Source, SourceContext};
