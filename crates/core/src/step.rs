//! Per-step data handed over by the step engine
//!
//! These types are produced by the engine after a step completes and are
//! read-only to the lifecycle core.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Project metadata visible to hooks and post-step handlers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectInfo {
    /// Base identifier, e.g. `ubuntu@24.04`
    pub base: String,
    /// Project name
    pub project_name: String,
}

impl ProjectInfo {
    pub fn new(base: impl Into<String>, project_name: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            project_name: project_name.into(),
        }
    }
}

/// State recorded by the engine for one completed step of one part
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    /// Files produced by the step, relative to the step directory
    pub files: BTreeSet<String>,
    /// Properties of the part that ran the step (includes `plugin`)
    pub part_properties: IndexMap<String, serde_json::Value>,
}

impl StepState {
    /// The part's plugin name, if recorded as a string
    pub fn plugin(&self) -> Option<&str> {
        self.part_properties
            .get("plugin")
            .and_then(|value| value.as_str())
    }
}

/// Information about a completed step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepInfo {
    /// Directory holding the primed files
    pub prime_dir: PathBuf,
    /// Rootfs (base layer) directory the step was run against
    pub rootfs_dir: PathBuf,
    /// Recorded state, absent when the engine has none
    pub state: Option<StepState>,
    /// Project metadata
    pub project_info: ProjectInfo,
}

impl StepInfo {
    /// Files recorded for this step; empty when no state was recorded
    pub fn files(&self) -> BTreeSet<String> {
        self.state
            .as_ref()
            .map(|state| state.files.clone())
            .unwrap_or_default()
    }
}
