//! Shared test helpers for core integration tests.

#![allow(dead_code)]

use rockcraft_core::errors::Result;
use rockcraft_core::hooks::HookPhase;
use rockcraft_core::lifecycle::{LifecycleHooks, ManagerArgs, StepEngine};
use rockcraft_core::step::{ProjectInfo, StepInfo};
use std::cell::RefCell;
use std::fs;
use std::path::Path;
use std::rc::Rc;

/// Step engine walking the pipeline phases and recording what it saw
///
/// Phases are appended to a shared log so tests can interleave them with
/// hook callbacks registered on the same log.
pub struct ScriptedEngine {
    pub log: Rc<RefCell<Vec<String>>>,
    pub project: ProjectInfo,
    pub primed: Vec<StepInfo>,
    pub fail_in_build: bool,
    pub manager_args: Option<ManagerArgs>,
}

impl ScriptedEngine {
    pub fn new(log: Rc<RefCell<Vec<String>>>, project: ProjectInfo) -> Self {
        Self {
            log,
            project,
            primed: Vec::new(),
            fail_in_build: false,
            manager_args: None,
        }
    }

    fn phase(&self, name: &str) {
        self.log.borrow_mut().push(name.to_string());
    }
}

impl StepEngine for ScriptedEngine {
    fn setup(&mut self, manager_args: &ManagerArgs) -> Result<()> {
        self.manager_args = Some(manager_args.clone());
        Ok(())
    }

    fn run(
        &mut self,
        _step_name: Option<&str>,
        _part_names: &[String],
        hooks: &mut dyn LifecycleHooks,
    ) -> Result<()> {
        self.phase("pull");
        hooks.fire(HookPhase::Prologue, &self.project)?;
        self.phase("overlay");
        self.phase("build");
        if self.fail_in_build {
            return Err(rockcraft_core::errors::ProcessError::ExternalCommand {
                argv: vec!["make".to_string()],
                exit_code: 2,
                stderr: "make: *** [all] Error 1".to_string(),
            }
            .into());
        }
        self.phase("stage");
        self.phase("prime");
        for info in &self.primed {
            hooks.post_prime(info)?;
        }
        hooks.fire(HookPhase::Epilogue, &self.project)
    }
}

/// Write `content` at `relative` under `root`, creating parent directories
pub fn write_file(root: &Path, relative: &str, content: &[u8]) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}
