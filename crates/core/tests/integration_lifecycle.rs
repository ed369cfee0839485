//! Integration tests for lifecycle orchestration
//!
//! These tests drive the orchestrator with a scripted step engine and a
//! recording command runner, checking hook ordering around the pipeline
//! phases, mount cleanup on failure, and prime post-processing.
#![cfg(unix)]

mod common;

use common::{write_file, ScriptedEngine};
use rockcraft_core::config::LifecycleSettings;
use rockcraft_core::errors::{ImageError, ProcessError, Result, RockcraftError};
use rockcraft_core::hooks::{HookPhase, HookRegistry};
use rockcraft_core::image::mock::StaticImageService;
use rockcraft_core::lifecycle::{
    LifecycleHooks, LifecycleOrchestrator, LifecycleState, StepEngine,
};
use rockcraft_core::process::mock::RecordingRunner;
use rockcraft_core::step::{ProjectInfo, StepInfo, StepState};
use serde_json::json;
use std::cell::RefCell;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;
use tempfile::TempDir;

struct Workspace {
    dir: TempDir,
    runner: Rc<RecordingRunner>,
    log: Rc<RefCell<Vec<String>>>,
}

impl Workspace {
    fn new() -> Self {
        rockcraft_core::logging::init(None).ok();
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("host/etc/apt")).unwrap();
        fs::create_dir_all(dir.path().join("base/etc")).unwrap();
        Self {
            dir,
            runner: Rc::new(RecordingRunner::new()),
            log: Rc::new(RefCell::new(Vec::new())),
        }
    }

    fn base(&self) -> PathBuf {
        self.dir.path().join("base")
    }

    fn project(&self) -> ProjectInfo {
        ProjectInfo::new("ubuntu@24.04", "lifecycle-test")
    }

    fn settings(&self) -> LifecycleSettings {
        LifecycleSettings {
            host_root: self.dir.path().join("host"),
            ..Default::default()
        }
    }

    fn orchestrator(
        &self,
        engine: ScriptedEngine,
    ) -> LifecycleOrchestrator<ScriptedEngine, StaticImageService> {
        LifecycleOrchestrator::new(
            engine,
            StaticImageService::new(self.base(), "sha256:feed"),
            self.project(),
            self.settings(),
            self.runner.clone(),
        )
    }

    fn umounts(&self) -> Vec<String> {
        self.runner
            .command_lines()
            .into_iter()
            .filter(|l| l.starts_with("umount"))
            .collect()
    }
}

#[test]
fn test_hooks_fire_around_pipeline_phases_in_registration_order() {
    let ws = Workspace::new();
    let mut registry = HookRegistry::new();
    for name in ["prologueA", "prologueB"] {
        let log = ws.log.clone();
        registry.register(HookPhase::Prologue, name, move |_| {
            log.borrow_mut().push(name.to_string());
            Ok(())
        });
    }
    for name in ["epilogueA", "epilogueB"] {
        let log = ws.log.clone();
        registry.register(HookPhase::Epilogue, name, move |_| {
            log.borrow_mut().push(name.to_string());
            Ok(())
        });
    }

    struct Hooks(HookRegistry);
    impl LifecycleHooks for Hooks {
        fn fire(&mut self, phase: HookPhase, project: &ProjectInfo) -> Result<()> {
            self.0.fire(phase, project)
        }
        fn post_prime(&mut self, _step_info: &StepInfo) -> Result<bool> {
            Ok(true)
        }
    }

    let mut engine = ScriptedEngine::new(ws.log.clone(), ws.project());
    let mut hooks = Hooks(registry);
    engine.run(None, &[], &mut hooks).unwrap();

    assert_eq!(
        *ws.log.borrow(),
        vec![
            "pull",
            "prologueA",
            "prologueB",
            "overlay",
            "build",
            "stage",
            "prime",
            "epilogueA",
            "epilogueB"
        ]
    );
}

#[test]
fn test_full_run_clones_upgrades_and_cleans_up() {
    let ws = Workspace::new();
    let mut orchestrator = ws.orchestrator(ScriptedEngine::new(ws.log.clone(), ws.project()));

    orchestrator.setup().unwrap();
    let args = orchestrator.engine().manager_args.clone().unwrap();
    assert_eq!(args["base_layer_hash"], json!("sha256:feed"));
    assert_eq!(args["project_name"], json!("lifecycle-test"));

    orchestrator.run(None, &[]).unwrap();
    assert_eq!(orchestrator.state(), LifecycleState::Done);

    let base = ws.base();
    let apt = base.join("etc/apt");
    let host = ws.dir.path().join("host");
    assert_eq!(
        ws.runner.command_lines(),
        vec![
            format!("mount -t tmpfs -o size=50% tmpfs {}", apt.display()),
            format!("cp -prT {} {}", host.join("etc/apt").display(), apt.display()),
            format!(
                "cp {} {}",
                host.join("etc/resolv.conf").display(),
                base.join("etc/resolv.conf").display()
            ),
            format!("mount --bind {} {}", host.join("dev").display(), base.join("dev").display()),
            format!("chroot {} apt-get install -y ca-certificates", base.display()),
            format!("chroot {} apt-get update", base.display()),
            format!("chroot {} apt-get upgrade -y", base.display()),
            format!("umount {}", base.join("dev").display()),
            format!("umount {}", apt.display()),
        ]
    );
    assert!(orchestrator.outstanding_mounts().is_empty());
}

#[test]
fn test_chroot_failure_surfaces_and_still_unmounts() {
    let ws = Workspace::new();
    let base = ws.base();
    ws.runner.fail_on(
        &["chroot", base.to_str().unwrap(), "apt-get", "update"],
        100,
        "E: Failed to fetch",
    );

    let mut orchestrator = ws.orchestrator(ScriptedEngine::new(ws.log.clone(), ws.project()));
    orchestrator.setup().unwrap();
    let err = orchestrator.run(None, &[]).unwrap_err();

    match err {
        RockcraftError::Process(ProcessError::ExternalCommand {
            exit_code, stderr, ..
        }) => {
            assert_eq!(exit_code, 100);
            assert!(stderr.contains("Failed to fetch"));
        }
        other => panic!("unexpected error: {other}"),
    }

    // /dev released by the upgrader, apt clone by the end-of-run cleanup.
    assert_eq!(
        ws.umounts(),
        vec![
            format!("umount {}", base.join("dev").display()),
            format!("umount {}", base.join("etc/apt").display()),
        ]
    );
    assert!(!ws.log.borrow().contains(&"overlay".to_string()));
    assert!(orchestrator.outstanding_mounts().is_empty());
}

#[test]
fn test_engine_failure_releases_apt_clone_once() {
    let ws = Workspace::new();
    let mut engine = ScriptedEngine::new(ws.log.clone(), ws.project());
    engine.fail_in_build = true;

    let mut orchestrator = ws.orchestrator(engine);
    orchestrator.setup().unwrap();
    let err = orchestrator.run(None, &[]).unwrap_err();
    assert!(err.to_string().contains("make"));

    let apt_umounts = ws
        .umounts()
        .into_iter()
        .filter(|l| l.ends_with("etc/apt"))
        .count();
    assert_eq!(apt_umounts, 1);
    assert!(orchestrator.outstanding_mounts().is_empty());
}

#[test]
fn test_base_resolution_failure_stops_before_engine() {
    let ws = Workspace::new();
    let mut orchestrator = LifecycleOrchestrator::new(
        ScriptedEngine::new(ws.log.clone(), ws.project()),
        StaticImageService::failing("ubuntu@24.04", "manifest unknown"),
        ws.project(),
        ws.settings(),
        ws.runner.clone(),
    );

    let err = orchestrator.setup().unwrap_err();
    assert!(matches!(
        err,
        RockcraftError::Image(ImageError::BaseResolution { .. })
    ));
    assert!(orchestrator.engine().manager_args.is_none());

    assert!(orchestrator.run(None, &[]).is_err());
    assert!(ws.log.borrow().is_empty());
    assert!(ws.runner.history().is_empty());
}

#[test]
fn test_post_prime_for_each_part_prunes_against_base() {
    let ws = Workspace::new();
    let base = ws.base();
    let prime = ws.dir.path().join("prime");
    write_file(&base, "usr/bin/sh", b"sh");
    write_file(&prime, "usr/bin/sh", b"sh");
    write_file(&prime, "usr/local/app", b"app");
    write_file(&prime, "usr/local/tool", b"tool");

    let part = |files: &[&str]| {
        let mut state = StepState::default();
        state.files = files.iter().map(|f| f.to_string()).collect();
        state
            .part_properties
            .insert("plugin".to_string(), json!("dump"));
        StepInfo {
            prime_dir: prime.clone(),
            rootfs_dir: base.clone(),
            state: Some(state),
            project_info: ws.project(),
        }
    };

    let mut engine = ScriptedEngine::new(ws.log.clone(), ws.project());
    engine.primed = vec![part(&["usr/bin/sh", "usr/local/app"]), part(&["usr/local/tool"])];

    let mut orchestrator = ws.orchestrator(engine);
    orchestrator.setup().unwrap();
    orchestrator.run(Some("prime"), &[]).unwrap();

    assert!(!prime.join("usr/bin/sh").exists());
    assert!(prime.join("usr/local/app").exists());
    assert!(prime.join("usr/local/tool").exists());

    let prime_completions = orchestrator
        .transitions()
        .iter()
        .filter(|t| t.to == LifecycleState::PrimeCompleted)
        .count();
    assert_eq!(prime_completions, 2);
    assert_eq!(orchestrator.state(), LifecycleState::Done);
}

#[test]
fn test_busy_apt_clone_after_prime_fails_the_run() {
    let ws = Workspace::new();
    let base = ws.base();
    let prime = ws.dir.path().join("prime");
    write_file(&prime, "usr/local/app", b"app");
    let apt = base.join("etc/apt");
    ws.runner
        .fail_on(&["umount", apt.to_str().unwrap()], 32, "target is busy");

    let mut state = StepState::default();
    state.files.insert("usr/local/app".to_string());
    let mut engine = ScriptedEngine::new(ws.log.clone(), ws.project());
    engine.primed = vec![StepInfo {
        prime_dir: prime.clone(),
        rootfs_dir: base.clone(),
        state: Some(state),
        project_info: ws.project(),
    }];

    let mut orchestrator = ws.orchestrator(engine);
    orchestrator.setup().unwrap();
    let err = orchestrator.run(None, &[]).unwrap_err();

    assert!(err.to_string().contains("target is busy"));
    assert_eq!(orchestrator.state(), LifecycleState::PipelineRunning);
    assert!(orchestrator
        .transitions()
        .iter()
        .any(|t| t.to == LifecycleState::PrimeCompleted));
    assert!(orchestrator.outstanding_mounts().is_empty());
}
