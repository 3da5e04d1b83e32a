//! Source driver boundary.
//!
//! The code-review host drivers own change metadata, mergeability policy and
//! branch protection. This module defines the capabilities the gate queue
//! consumes from them and the registry of configured connections.

use std::{collections::BTreeMap, future::Future, sync::Arc, time::Duration};

use crate::{
    branch_cache::BranchProtectionCache,
    change::{Change, ChangeKey, Project, TriggerEvent},
    Error, Result,
};

/// Capabilities a code-review host driver exposes to the gate queue.
///
/// All calls may suspend; the admission walk resumes with the result before
/// continuing and never reorders around a suspension point.
#[async_trait::async_trait]
pub trait Source: Send + Sync {
    /// Look up a change by key.
    async fn get_change(&self, key: &ChangeKey, event: &TriggerEvent)
        -> Result<Option<Arc<Change>>>;

    /// Whether the change satisfies the host's submit policy.
    ///
    /// `allow_needs` lists review labels the pipeline sets itself and which
    /// therefore must not block. With `allow_refresh` the driver re-fetches
    /// mergeability data instead of using what it has cached.
    async fn can_merge(
        &self,
        change: &Change,
        allow_needs: &[String],
        event: &TriggerEvent,
        allow_refresh: bool,
    ) -> Result<bool>;

    /// Open changes in `projects` that declare a need on `change`.
    async fn get_changes_depending_on(
        &self,
        change: &Change,
        projects: &[Project],
        tenant: &str,
    ) -> Result<Vec<Arc<Change>>>;

    /// Whether the branch is protected; `None` if it cannot be determined.
    async fn is_branch_protected(
        &self,
        project: &str,
        branch: &str,
        event: Option<&TriggerEvent>,
    ) -> Result<Option<bool>>;

    /// List branches of a project, optionally only protected ones.
    async fn fetch_project_branches(
        &self,
        project: &str,
        exclude_unprotected: bool,
    ) -> Result<Vec<String>>;

    /// Re-derive the cross-repository prerequisites of a change.
    async fn commit_dependencies(
        &self,
        change: &Change,
        _event: &TriggerEvent,
    ) -> Result<Vec<ChangeKey>> {
        Ok(change
            .dependencies
            .links()
            .and_then(|links| links.commit_needs_changes.clone())
            .unwrap_or_default())
    }
}

/// A named driver connection and its branch protection cache.
pub struct Connection {
    name: String,
    source: Arc<dyn Source>,
    branch_cache: BranchProtectionCache,
}

impl Connection {
    /// Create a connection with an empty branch cache
    #[must_use]
    pub fn new(name: impl Into<String>, source: Arc<dyn Source>) -> Self {
        let name = name.into();
        Self {
            branch_cache: BranchProtectionCache::new(name.clone(), Arc::clone(&source)),
            name,
            source,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn source(&self) -> &dyn Source {
        self.source.as_ref()
    }

    #[must_use]
    pub const fn branch_cache(&self) -> &BranchProtectionCache {
        &self.branch_cache
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Registry of driver connections, shared by every tenant pipeline.
#[derive(Debug, Default)]
pub struct Connections {
    connections: BTreeMap<String, Arc<Connection>>,
}

impl Connections {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source under a connection name, replacing any previous one
    pub fn register(&mut self, name: impl Into<String>, source: Arc<dyn Source>) {
        let connection = Connection::new(name, source);
        self.connections
            .insert(connection.name().to_string(), Arc::new(connection));
    }

    /// Add a source, builder style
    #[must_use]
    pub fn with_source(mut self, name: impl Into<String>, source: Arc<dyn Source>) -> Self {
        self.register(name, source);
        self
    }

    /// Look up a connection
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownConnection` if nothing is registered under `name`.
    pub fn get(&self, name: &str) -> Result<&Arc<Connection>> {
        self.connections
            .get(name)
            .ok_or_else(|| Error::UnknownConnection(name.to_string()))
    }

    /// The connection hosting `project`
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownConnection` if the project's connection is not registered.
    pub fn for_project(&self, project: &Project) -> Result<&Arc<Connection>> {
        self.get(&project.connection)
    }

    /// All connections in name order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Connection>> {
        self.connections.values()
    }
}

/// Run a driver call under an optional deadline.
///
/// # Errors
///
/// Returns `Error::Timeout` if the deadline elapses, otherwise the call's own result.
pub async fn with_deadline<T, F>(deadline: Option<Duration>, call: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send,
{
    match deadline {
        None => call.await,
        Some(limit) => tokio::time::timeout(limit, call)
            .await
            .map_err(|_| Error::Timeout {
                millis: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
            })?,
    }
}

/// Driver access for one pipeline: connection registry, deadline and the
/// submit labels the pipeline is allowed to need.
#[derive(Debug, Clone, Copy)]
pub struct SourceContext<'a> {
    pub connections: &'a Connections,
    pub deadline: Option<Duration>,
    pub allow_needs: &'a [String],
    pub tenant: &'a str,
}

impl SourceContext<'_> {
    /// Resolve a change key through the connection that hosts it.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownConnection`, `Error::Timeout` or the driver's error.
    pub async fn get_change(&self, key: &ChangeKey, event: &TriggerEvent) -> Result<Option<Arc<Change>>> {
        let connection = self.connections.for_project(&key.project)?;
        with_deadline(self.deadline, connection.source().get_change(key, event)).await
    }

    /// Mergeability check against the change's own connection.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownConnection`, `Error::Timeout` or the driver's error.
    pub async fn can_merge(&self, change: &Change, event: &TriggerEvent, allow_refresh: bool) -> Result<bool> {
        let connection = self.connections.for_project(change.project())?;
        with_deadline(
            self.deadline,
            connection
                .source()
                .can_merge(change, self.allow_needs, event, allow_refresh),
        )
        .await
    }

    /// Re-derive a change's cross-repository prerequisites.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownConnection`, `Error::Timeout` or the driver's error.
    pub async fn commit_dependencies(&self, change: &Change, event: &TriggerEvent) -> Result<Vec<ChangeKey>> {
        let connection = self.connections.for_project(change.project())?;
        with_deadline(
            self.deadline,
            connection.source().commit_dependencies(change, event),
        )
        .await
    }

    /// Ask one connection for open changes declaring a need on `change`.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownConnection`, `Error::Timeout` or the driver's error.
    pub async fn changes_depending_on(
        &self,
        connection: &str,
        change: &Change,
        projects: &[Project],
    ) -> Result<Vec<Arc<Change>>> {
        let connection = self.connections.get(connection)?;
        with_deadline(
            self.deadline,
            connection
                .source()
                .get_changes_depending_on(change, projects, self.tenant),
        )
        .await
    }
}
