//! Pipeline configuration
//!
//! Loaded from TOML. Keys are kebab-case; everything has a default so an
//! empty document yields a usable dependent pipeline.
//!
//! # Example Config
//!
//! ```toml
//! name = "gate"
//! tenant = "example"
//! max-dependencies = 30
//! submit-allow-needs = ["Verified"]
//!
//! [window]
//! window = 20
//! window-floor = 3
//! window-increase-type = "linear"
//! window-increase-factor = 1
//! window-decrease-type = "exponential"
//! window-decrease-factor = 2
//!
//! [[queues]]
//! name = "integrated"
//! projects = ["org/server", "org/client"]
//! allow-circular-dependencies = true
//! ```

use std::{collections::HashSet, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{Error, Result};

/// How a queue window grows or shrinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum WindowType {
    /// Add or subtract the factor
    Linear,
    /// Multiply or divide by the factor
    Exponential,
}

/// Window policy shared by every queue of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct WindowConfig {
    /// Initial window; 0 means unlimited
    pub window: u32,
    /// The window never shrinks below this
    pub window_floor: u32,
    pub window_increase_type: WindowType,
    pub window_increase_factor: u32,
    pub window_decrease_type: WindowType,
    pub window_decrease_factor: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            window: 20,
            window_floor: 3,
            window_increase_type: WindowType::Linear,
            window_increase_factor: 1,
            window_decrease_type: WindowType::Exponential,
            window_decrease_factor: 2,
        }
    }
}

impl WindowConfig {
    fn validate(&self) -> Result<()> {
        if self.window_floor == 0 {
            return Err(Error::InvalidConfig(
                "window-floor must be at least 1".to_string(),
            ));
        }
        if self.window != 0 && self.window < self.window_floor {
            return Err(Error::InvalidConfig(format!(
                "window {} is below window-floor {}",
                self.window, self.window_floor
            )));
        }
        if self.window_increase_type == WindowType::Exponential && self.window_increase_factor == 0 {
            return Err(Error::InvalidConfig(
                "exponential window-increase-factor must be at least 1".to_string(),
            ));
        }
        if self.window_decrease_type == WindowType::Exponential && self.window_decrease_factor == 0 {
            return Err(Error::InvalidConfig(
                "exponential window-decrease-factor must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// A named, long-lived queue shared by several projects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SharedQueueConfig {
    pub name: String,
    /// Project names gated together in this queue
    #[serde(default)]
    pub projects: Vec<String>,
    /// Whether dependency cycles may be admitted as bundles
    #[serde(default)]
    pub allow_circular_dependencies: bool,
}

/// Configuration of one dependent (gate) pipeline of a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PipelineConfig {
    pub name: String,
    pub tenant: String,
    pub window: WindowConfig,
    pub queues: Vec<SharedQueueConfig>,
    /// Upper bound on the dependency graph built for one admission
    pub max_dependencies: Option<usize>,
    /// Review labels this pipeline sets itself before submitting
    pub submit_allow_needs: Vec<String>,
    /// Tenant branch policy used by [`crate::GateQueueManager::project_branches`]
    pub exclude_unprotected_branches: bool,
    /// Remove queued items when a newer patchset arrives
    pub dequeue_on_new_patchset: bool,
    /// Deadline for each driver call; expiry counts as blocked
    pub source_timeout_ms: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: "gate".to_string(),
            tenant: "default".to_string(),
            window: WindowConfig::default(),
            queues: Vec::new(),
            max_dependencies: None,
            submit_allow_needs: Vec::new(),
            exclude_unprotected_branches: false,
            dequeue_on_new_patchset: true,
            source_timeout_ms: None,
        }
    }
}

impl PipelineConfig {
    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigParse` for malformed TOML and
    /// `Error::InvalidConfig` if validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the file cannot be read, otherwise as
    /// [`Self::from_toml_str`].
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path.as_ref()).await?;
        let config = Self::from_toml_str(&raw)?;
        tracing::debug!(
            path = %path.as_ref().display(),
            pipeline = %config.name,
            queues = config.queues.len(),
            "Loaded pipeline config"
        );
        Ok(config)
    }

    /// Validate cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` describing the first violation.
    pub fn validate(&self) -> Result<()> {
        self.window.validate()?;

        let mut names = HashSet::new();
        let mut projects = HashSet::new();
        for queue in &self.queues {
            if queue.name.is_empty() {
                return Err(Error::InvalidConfig("queue name must not be empty".to_string()));
            }
            if !names.insert(queue.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate queue name '{}'",
                    queue.name
                )));
            }
            for project in &queue.projects {
                if !projects.insert(project.as_str()) {
                    return Err(Error::InvalidConfig(format!(
                        "project '{project}' is listed in more than one queue"
                    )));
                }
            }
        }
        Ok(())
    }

    /// The shared queue a project is configured into, if any.
    #[must_use]
    pub fn queue_for_project(&self, project: &str) -> Option<&SharedQueueConfig> {
        self.queues
            .iter()
            .find(|queue| queue.projects.iter().any(|p| p == project))
    }

    /// Driver call deadline, if configured.
    #[must_use]
    pub fn source_timeout(&self) -> Option<Duration> {
        self.source_timeout_ms.map(Duration::from_millis)
    }
}
