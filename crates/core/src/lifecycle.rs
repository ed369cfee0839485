//! Lifecycle orchestration
//!
//! The orchestrator owns one build pipeline run against a base image:
//!
//! 1. `setup` resolves the base image and hands the pipeline configuration to
//!    the step engine.
//! 2. `run` registers the environment hooks for this run and executes the
//!    pipeline. The engine fires prologue hooks before its overlay phase,
//!    epilogue hooks after its final phase, and reports each completed prime
//!    step back through [`LifecycleHooks::post_prime`].
//! 3. `post_prime` prunes primed files against the base layer and applies the
//!    python usrmerge fix.
//!
//! The states are `Idle -> ConfiguringBase -> HooksRegistered -> PipelineRunning
//! -> PrimeCompleted -> Done`; calling an operation from any other state fails
//! with [`LifecycleError::InvalidState`].

use crate::config::LifecycleSettings;
use crate::environment::{register_apt_config_clone, EnvironmentCloner};
use crate::errors::{LifecycleError, Result};
use crate::hooks::{HookPhase, HookRegistry};
use crate::image::{BaseImageInfo, ImageService};
use crate::layers::prune_prime_files;
use crate::mount::MountTracker;
use crate::overlay::OverlayUpgrader;
use crate::process::{is_privileged, CommandRunner};
use crate::step::{ProjectInfo, StepInfo};
use crate::usrmerge::python_usrmerge_fix;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::path::PathBuf;
use std::rc::Rc;
use tracing::{debug, error, info, instrument, warn};

/// Arguments handed to the step engine on setup
pub type ManagerArgs = IndexMap<String, Value>;

/// Where a lifecycle run currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LifecycleState {
    /// Nothing done yet
    Idle,
    /// Base image resolved and pipeline configured
    ConfiguringBase,
    /// Environment hooks registered for the run
    HooksRegistered,
    /// Step engine executing
    PipelineRunning,
    /// Prime post-processing finished
    PrimeCompleted,
    /// Run finished
    Done,
}

impl LifecycleState {
    /// Get the state name as string
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Idle => "idle",
            LifecycleState::ConfiguringBase => "configuringBase",
            LifecycleState::HooksRegistered => "hooksRegistered",
            LifecycleState::PipelineRunning => "pipelineRunning",
            LifecycleState::PrimeCompleted => "primeCompleted",
            LifecycleState::Done => "done",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub at: DateTime<Utc>,
}

/// Pipeline configuration merged into the manager arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub base_layer_dir: PathBuf,
    pub base_layer_hash: String,
    pub base: String,
    pub project_name: String,
    /// The overlay is assembled on the unpacked base, so this is the base layer dir
    pub rootfs_dir: PathBuf,
}

impl PipelineConfig {
    pub fn new(base_image: &BaseImageInfo, project: &ProjectInfo) -> Self {
        Self {
            base_layer_dir: base_image.base_layer_dir.clone(),
            base_layer_hash: base_image.base_digest.clone(),
            base: base_image.base_identifier.clone(),
            project_name: project.project_name.clone(),
            rootfs_dir: base_image.base_layer_dir.clone(),
        }
    }

    /// Flat key/value form, in field order
    pub fn to_manager_args(&self) -> ManagerArgs {
        let mut args = ManagerArgs::new();
        args.insert(
            "base_layer_dir".to_string(),
            json!(self.base_layer_dir.to_string_lossy()),
        );
        args.insert("base_layer_hash".to_string(), json!(self.base_layer_hash));
        args.insert("base".to_string(), json!(self.base));
        args.insert("project_name".to_string(), json!(self.project_name));
        args.insert(
            "rootfs_dir".to_string(),
            json!(self.rootfs_dir.to_string_lossy()),
        );
        args
    }

    /// Merge into `args`; existing keys are overwritten
    pub fn merge_into(&self, args: &mut ManagerArgs) {
        args.extend(self.to_manager_args());
    }
}

/// Callbacks the step engine makes into the running lifecycle
pub trait LifecycleHooks {
    /// Fire every hook registered for `phase`
    fn fire(&mut self, phase: HookPhase, project: &ProjectInfo) -> Result<()>;

    /// Post-process a completed prime step
    fn post_prime(&mut self, step_info: &StepInfo) -> Result<bool>;
}

/// The generic build pipeline (pull, overlay, build, stage, prime)
pub trait StepEngine {
    /// Configure the engine before any step runs
    fn setup(&mut self, manager_args: &ManagerArgs) -> Result<()>;

    /// Execute the pipeline up to `step_name` (all steps when `None`) for
    /// `part_names` (all parts when empty)
    ///
    /// Implementations fire [`HookPhase::Prologue`] before the overlay phase,
    /// [`HookPhase::Epilogue`] after the final phase, and call
    /// [`LifecycleHooks::post_prime`] for each primed part.
    fn run(
        &mut self,
        step_name: Option<&str>,
        part_names: &[String],
        hooks: &mut dyn LifecycleHooks,
    ) -> Result<()>;
}

/// State shared between the orchestrator and the engine callbacks of one run
#[derive(Debug)]
struct RunScope {
    state: LifecycleState,
    transitions: Vec<StateTransition>,
    registry: HookRegistry,
    tracker: MountTracker,
}

impl RunScope {
    fn new() -> Self {
        Self {
            state: LifecycleState::Idle,
            transitions: Vec::new(),
            registry: HookRegistry::new(),
            tracker: MountTracker::new(),
        }
    }

    fn expect_state(&self, operation: &'static str, allowed: &[LifecycleState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(LifecycleError::InvalidState {
                operation,
                state: self.state.as_str(),
            }
            .into())
        }
    }

    fn transition(&mut self, to: LifecycleState) {
        info!("Lifecycle: {} -> {}", self.state, to);
        self.transitions.push(StateTransition {
            from: self.state,
            to,
            at: Utc::now(),
        });
        self.state = to;
    }
}

impl LifecycleHooks for RunScope {
    fn fire(&mut self, phase: HookPhase, project: &ProjectInfo) -> Result<()> {
        self.registry.fire(phase, project)
    }

    #[instrument(skip_all, fields(prime = %step_info.prime_dir.display()))]
    fn post_prime(&mut self, step_info: &StepInfo) -> Result<bool> {
        self.expect_state(
            "post-process prime",
            &[
                LifecycleState::PipelineRunning,
                LifecycleState::PrimeCompleted,
                LifecycleState::Done,
            ],
        )?;
        let after_run = self.state == LifecycleState::Done;

        let files = step_info.files();
        prune_prime_files(&step_info.prime_dir, &files, &step_info.rootfs_dir)?;
        python_usrmerge_fix(step_info)?;

        self.transition(LifecycleState::PrimeCompleted);
        // While the engine is running, only `run` may declare the pipeline done.
        if after_run {
            self.transition(LifecycleState::Done);
        }
        Ok(true)
    }
}

/// Drives one build pipeline run against a resolved base image
pub struct LifecycleOrchestrator<E: StepEngine, I: ImageService> {
    engine: E,
    image_service: I,
    project: ProjectInfo,
    settings: LifecycleSettings,
    runner: Rc<dyn CommandRunner>,
    manager_args: ManagerArgs,
    base_image: Option<BaseImageInfo>,
    scope: RunScope,
}

impl<E: StepEngine, I: ImageService> LifecycleOrchestrator<E, I> {
    /// Create an idle orchestrator
    pub fn new(
        engine: E,
        image_service: I,
        project: ProjectInfo,
        settings: LifecycleSettings,
        runner: Rc<dyn CommandRunner>,
    ) -> Self {
        Self {
            engine,
            image_service,
            project,
            settings,
            runner,
            manager_args: ManagerArgs::new(),
            base_image: None,
            scope: RunScope::new(),
        }
    }

    /// Start from caller-supplied manager arguments (e.g. cache and work dirs)
    pub fn with_manager_args(mut self, manager_args: ManagerArgs) -> Self {
        self.manager_args = manager_args;
        self
    }

    /// Resolve the base image and configure the step engine
    #[instrument(skip_all, fields(base = %self.project.base, project = %self.project.project_name))]
    pub fn setup(&mut self) -> Result<()> {
        self.scope.expect_state("set up", &[LifecycleState::Idle])?;

        let image = self.image_service.obtain_image()?;
        let base_image = BaseImageInfo::new(image, self.project.base.clone());
        debug!(
            "Base layer {} at {}",
            base_image.base_digest,
            base_image.base_layer_dir.display()
        );

        PipelineConfig::new(&base_image, &self.project).merge_into(&mut self.manager_args);
        self.engine.setup(&self.manager_args)?;

        self.base_image = Some(base_image);
        self.scope.transition(LifecycleState::ConfiguringBase);
        Ok(())
    }

    /// Register this run's hooks and execute the pipeline
    ///
    /// Mounts still outstanding when the engine returns are released before
    /// this returns; an engine error takes precedence over a release error.
    #[instrument(skip_all, fields(step = step_name.unwrap_or("all"), parts = part_names.len()))]
    pub fn run(&mut self, step_name: Option<&str>, part_names: &[String]) -> Result<()> {
        self.scope.expect_state("run", &[LifecycleState::ConfiguringBase])?;
        let rootfs_dir = match &self.base_image {
            Some(image) => image.base_layer_dir.clone(),
            None => {
                return Err(LifecycleError::InvalidState {
                    operation: "run",
                    state: self.scope.state.as_str(),
                }
                .into())
            }
        };

        if !is_privileged() {
            warn!("Not running as root; mount and chroot hooks are likely to fail");
        }

        let mut registry = HookRegistry::new();
        if self.settings.clone_apt_config {
            let cloner = EnvironmentCloner::new(self.runner.clone(), &self.settings.tmpfs_size);
            register_apt_config_clone(
                &mut registry,
                cloner,
                self.scope.tracker.clone(),
                &self.settings,
                &rootfs_dir,
            );
        }
        if self.settings.upgrade_overlay {
            OverlayUpgrader::new(self.runner.clone(), &self.settings)
                .register(&mut registry, &rootfs_dir);
        }
        self.scope.registry = registry;
        self.scope.transition(LifecycleState::HooksRegistered);

        self.scope.transition(LifecycleState::PipelineRunning);
        let outcome = self.engine.run(step_name, part_names, &mut self.scope);

        // Registrations never outlive the run.
        self.scope.registry = HookRegistry::new();
        let cleanup = self.scope.tracker.release_all();

        let result = match (outcome, cleanup) {
            (Err(e), Err(cleanup_error)) => {
                error!("Failed to release mounts after pipeline failure: {}", cleanup_error);
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Ok(()), Err(cleanup_error)) => Err(cleanup_error),
            (Ok(()), Ok(())) => Ok(()),
        };

        match &result {
            Ok(()) => self.scope.transition(LifecycleState::Done),
            Err(_) if self.scope.state != LifecycleState::PipelineRunning => {
                self.scope.transition(LifecycleState::PipelineRunning)
            }
            Err(_) => {}
        }
        result
    }

    /// Post-process a completed prime step: prune against the base layer,
    /// then apply the usrmerge fix
    pub fn post_prime(&mut self, step_info: &StepInfo) -> Result<bool> {
        self.scope.post_prime(step_info)
    }

    /// Current state
    pub fn state(&self) -> LifecycleState {
        self.scope.state
    }

    /// Every state change so far, oldest first
    pub fn transitions(&self) -> &[StateTransition] {
        &self.scope.transitions
    }

    /// Base image resolved by `setup`
    pub fn base_image(&self) -> Option<&BaseImageInfo> {
        self.base_image.as_ref()
    }

    /// Arguments handed to the engine on setup
    pub fn manager_args(&self) -> &ManagerArgs {
        &self.manager_args
    }

    /// Project metadata
    pub fn project(&self) -> &ProjectInfo {
        &self.project
    }

    /// The step engine
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Mount targets not yet released
    pub fn outstanding_mounts(&self) -> Vec<PathBuf> {
        self.scope.tracker.outstanding()
    }
}
