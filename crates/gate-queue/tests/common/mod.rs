//! Common test helpers and fixtures for integration tests
//!
//! `FakeSource` is an in-memory code-review host. Changes are registered up
//! front; dependents are found by scanning registered changes for a need on
//! the change in question.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use gate_queue::{
    Change, ChangeKey, Connections, Dependencies, DependencyLinks, Error, GateQueueManager,
    PipelineConfig, Project, Result, SharedQueueConfig, Source, TriggerEvent,
};

pub const CONNECTION: &str = "gerrit";

/// Install a test-friendly subscriber once; honours `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn project(name: &str) -> Project {
    Project::new(CONNECTION, name)
}

pub fn event() -> TriggerEvent {
    TriggerEvent::new("test-event")
}

/// An open, current change with no dependencies
pub fn change(project_name: &str, number: u64) -> Change {
    Change::new(project(project_name), "main", number, 1)
}

fn links_mut(change: &mut Change) -> &mut DependencyLinks {
    if let Dependencies::NoDependencies = change.dependencies {
        change.dependencies = Dependencies::HasDependencies(DependencyLinks::default());
    }
    match &mut change.dependencies {
        Dependencies::HasDependencies(links) => links,
        Dependencies::NoDependencies => unreachable!(),
    }
}

/// Add commit-stack parents
pub fn with_git_parents(mut change: Change, parents: &[&ChangeKey]) -> Change {
    links_mut(&mut change)
        .git_needs_changes
        .extend(parents.iter().map(|key| (*key).clone()));
    change
}

/// Add cross-repository prerequisites
pub fn with_needs(mut change: Change, needs: &[&ChangeKey]) -> Change {
    links_mut(&mut change)
        .commit_needs_changes
        .get_or_insert_with(Vec::new)
        .extend(needs.iter().map(|key| (*key).clone()));
    change
}

/// In-memory driver
#[derive(Default)]
pub struct FakeSource {
    changes: Mutex<HashMap<ChangeKey, Arc<Change>>>,
    unmergeable: Mutex<HashSet<ChangeKey>>,
    commit_dependencies: Mutex<HashMap<ChangeKey, Vec<ChangeKey>>>,
    protection: Mutex<HashMap<(String, String), Option<bool>>>,
    branches: Mutex<HashMap<String, Vec<String>>>,
    fail_lookups: Mutex<bool>,
    delay: Mutex<Option<Duration>>,
    pub lookups: AtomicUsize,
    pub refreshed_checks: AtomicUsize,
    pub branch_fetches: AtomicUsize,
}

impl FakeSource {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register (or replace) a change
    pub fn add(&self, change: Change) -> Arc<Change> {
        let change = Arc::new(change);
        self.changes
            .lock()
            .unwrap()
            .insert(change.key.clone(), Arc::clone(&change));
        change
    }

    pub fn set_mergeable(&self, key: &ChangeKey, mergeable: bool) {
        let mut unmergeable = self.unmergeable.lock().unwrap();
        if mergeable {
            unmergeable.remove(key);
        } else {
            unmergeable.insert(key.clone());
        }
    }

    /// What `commit_dependencies` reports for a change
    pub fn set_commit_dependencies(&self, key: &ChangeKey, needs: Vec<ChangeKey>) {
        self.commit_dependencies
            .lock()
            .unwrap()
            .insert(key.clone(), needs);
    }

    pub fn set_protection(&self, project: &str, branch: &str, protected: Option<bool>) {
        self.protection
            .lock()
            .unwrap()
            .insert((project.to_string(), branch.to_string()), protected);
    }

    pub fn set_branches(&self, project: &str, branches: &[&str]) {
        self.branches.lock().unwrap().insert(
            project.to_string(),
            branches.iter().map(ToString::to_string).collect(),
        );
    }

    pub fn fail_lookups(&self, fail: bool) {
        *self.fail_lookups.lock().unwrap() = fail;
    }

    /// Delay every driver call
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Source for FakeSource {
    async fn get_change(
        &self,
        key: &ChangeKey,
        _event: &TriggerEvent,
    ) -> Result<Option<Arc<Change>>> {
        self.pause().await;
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if *self.fail_lookups.lock().unwrap() {
            return Err(Error::source_failure(CONNECTION, "lookup failed"));
        }
        Ok(self.changes.lock().unwrap().get(key).cloned())
    }

    async fn can_merge(
        &self,
        change: &Change,
        _allow_needs: &[String],
        _event: &TriggerEvent,
        allow_refresh: bool,
    ) -> Result<bool> {
        self.pause().await;
        if allow_refresh {
            self.refreshed_checks.fetch_add(1, Ordering::SeqCst);
        }
        Ok(!self.unmergeable.lock().unwrap().contains(&change.key))
    }

    async fn get_changes_depending_on(
        &self,
        change: &Change,
        projects: &[Project],
        _tenant: &str,
    ) -> Result<Vec<Arc<Change>>> {
        self.pause().await;
        let changes = self.changes.lock().unwrap();
        let mut dependents: Vec<Arc<Change>> = changes
            .values()
            .filter(|other| projects.contains(other.project()))
            .filter(|other| other.needs_changes().contains(&change.key))
            .cloned()
            .collect();
        dependents.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(dependents)
    }

    async fn is_branch_protected(
        &self,
        project: &str,
        branch: &str,
        _event: Option<&TriggerEvent>,
    ) -> Result<Option<bool>> {
        Ok(self
            .protection
            .lock()
            .unwrap()
            .get(&(project.to_string(), branch.to_string()))
            .copied()
            .flatten())
    }

    async fn fetch_project_branches(
        &self,
        project: &str,
        exclude_unprotected: bool,
    ) -> Result<Vec<String>> {
        self.pause().await;
        self.branch_fetches.fetch_add(1, Ordering::SeqCst);
        let all = self
            .branches
            .lock()
            .unwrap()
            .get(project)
            .cloned()
            .unwrap_or_default();
        if !exclude_unprotected {
            return Ok(all);
        }
        let protection = self.protection.lock().unwrap();
        Ok(all
            .into_iter()
            .filter(|branch| {
                protection
                    .get(&(project.to_string(), branch.clone()))
                    .copied()
                    .flatten()
                    .unwrap_or(false)
            })
            .collect())
    }

    async fn commit_dependencies(
        &self,
        change: &Change,
        _event: &TriggerEvent,
    ) -> Result<Vec<ChangeKey>> {
        let configured = self
            .commit_dependencies
            .lock()
            .unwrap()
            .get(&change.key)
            .cloned();
        Ok(configured.unwrap_or_else(|| {
            change
                .dependencies
                .links()
                .and_then(|links| links.commit_needs_changes.clone())
                .unwrap_or_default()
        }))
    }
}

/// A shared queue definition
pub fn shared_queue(name: &str, projects: &[&str], allow_cycles: bool) -> SharedQueueConfig {
    SharedQueueConfig {
        name: name.to_string(),
        projects: projects.iter().map(ToString::to_string).collect(),
        allow_circular_dependencies: allow_cycles,
    }
}

/// A manager over one fake connection
pub fn manager_with(config: PipelineConfig, source: &Arc<FakeSource>) -> GateQueueManager {
    init_tracing();
    let connections = Connections::new().with_source(CONNECTION, Arc::clone(source) as Arc<dyn Source>);
    GateQueueManager::new(config, Arc::new(connections)).unwrap()
}

/// A manager with default configuration
pub fn manager(source: &Arc<FakeSource>) -> GateQueueManager {
    manager_with(PipelineConfig::default(), source)
}
