//! Scoped mounts inside the build rootfs
//!
//! Every mount made by the lifecycle hooks is represented by a [`MountGuard`].
//! A guard unmounts its target exactly once: either explicitly through
//! [`MountGuard::release`], or on drop if it was never released. Guards that
//! must survive across hook callbacks are parked in a run-scoped
//! [`MountTracker`] so the orchestrator can release whatever is still
//! outstanding when the pipeline ends, whether it succeeded or not.
//!
//! ## Mount kinds
//! - `tmpfs`: memory-backed filesystem, used for cloned host configuration
//! - `bind`: bind mount of a host directory (e.g. `/dev`)

use crate::errors::{EnvironmentError, Result};
use crate::process::{argv, CommandRunner};
use std::cell::RefCell;
use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{debug, error, instrument, warn};

/// Kind of mount held by a guard
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountKind {
    /// Memory-backed filesystem with the given `size=` option
    Tmpfs { size: String },
    /// Bind mount of a host path
    Bind { source: PathBuf },
}

impl fmt::Display for MountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountKind::Tmpfs { size } => write!(f, "tmpfs (size={})", size),
            MountKind::Bind { source } => write!(f, "bind from {}", source.display()),
        }
    }
}

/// An active mount that is unmounted exactly once
pub struct MountGuard {
    target: PathBuf,
    kind: MountKind,
    runner: Rc<dyn CommandRunner>,
    active: bool,
}

impl MountGuard {
    /// Mount a tmpfs at `target`
    #[instrument(skip_all, fields(target = %target.display(), size = %size))]
    pub fn tmpfs(runner: Rc<dyn CommandRunner>, target: &Path, size: &str) -> Result<Self> {
        let options = format!("size={}", size);
        runner.run(&argv([
            OsStr::new("mount"),
            OsStr::new("-t"),
            OsStr::new("tmpfs"),
            OsStr::new("-o"),
            OsStr::new(&options),
            OsStr::new("tmpfs"),
            target.as_os_str(),
        ]))?;
        Ok(Self::activated(
            runner,
            target,
            MountKind::Tmpfs {
                size: size.to_string(),
            },
        ))
    }

    /// Bind-mount `source` onto `target`
    #[instrument(skip_all, fields(source = %source.display(), target = %target.display()))]
    pub fn bind(runner: Rc<dyn CommandRunner>, source: &Path, target: &Path) -> Result<Self> {
        runner.run(&argv([
            OsStr::new("mount"),
            OsStr::new("--bind"),
            source.as_os_str(),
            target.as_os_str(),
        ]))?;
        Ok(Self::activated(
            runner,
            target,
            MountKind::Bind {
                source: source.to_path_buf(),
            },
        ))
    }

    fn activated(runner: Rc<dyn CommandRunner>, target: &Path, kind: MountKind) -> Self {
        debug!("Mounted {} at {}", kind, target.display());
        Self {
            target: target.to_path_buf(),
            kind,
            runner,
            active: true,
        }
    }

    /// Mount point
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Kind of mount
    pub fn kind(&self) -> &MountKind {
        &self.kind
    }

    /// Unmount the target
    ///
    /// The guard is spent even when `umount` fails, so the unmount is never
    /// attempted twice for the same mount.
    pub fn release(mut self) -> Result<()> {
        self.active = false;
        self.unmount()
    }

    fn unmount(&self) -> Result<()> {
        debug!("Unmounting {} at {}", self.kind, self.target.display());
        self.runner
            .run(&argv([OsStr::new("umount"), self.target.as_os_str()]))?;
        Ok(())
    }
}

impl fmt::Debug for MountGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountGuard")
            .field("target", &self.target)
            .field("kind", &self.kind)
            .field("active", &self.active)
            .finish()
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        if self.active {
            self.active = false;
            warn!(
                "Mount at {} was not released explicitly; unmounting",
                self.target.display()
            );
            if let Err(e) = self.unmount() {
                error!("Failed to unmount {}: {}", self.target.display(), e);
            }
        }
    }
}

/// Run-scoped set of outstanding mounts
///
/// Cloning the tracker yields another handle to the same set, so a prologue
/// callback can park a guard that the paired epilogue callback later releases.
#[derive(Debug, Clone, Default)]
pub struct MountTracker {
    mounts: Rc<RefCell<Vec<MountGuard>>>,
}

impl MountTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of an active mount until it is released
    pub fn track(&self, guard: MountGuard) {
        debug!("Tracking mount at {}", guard.target().display());
        self.mounts.borrow_mut().push(guard);
    }

    /// Release the most recent mount at `target`
    ///
    /// Returns `false` when nothing is tracked at `target` (already released,
    /// or never mounted because an earlier step failed).
    pub fn release(&self, target: &Path) -> Result<bool> {
        let guard = {
            let mut mounts = self.mounts.borrow_mut();
            match mounts.iter().rposition(|m| m.target() == target) {
                Some(index) => mounts.remove(index),
                None => return Ok(false),
            }
        };
        guard.release()?;
        Ok(true)
    }

    /// Release every outstanding mount, most recent first
    ///
    /// All releases are attempted; the first failure is returned and later
    /// ones are logged.
    pub fn release_all(&self) -> Result<()> {
        let drained: Vec<MountGuard> = self.mounts.borrow_mut().drain(..).rev().collect();
        let mut first_error = None;
        for guard in drained {
            let target = guard.target().to_path_buf();
            warn!("Releasing outstanding mount at {}", target.display());
            if let Err(e) = guard.release() {
                error!("Failed to release mount at {}: {}", target.display(), e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Targets of mounts not yet released, in mount order
    pub fn outstanding(&self) -> Vec<PathBuf> {
        self.mounts
            .borrow()
            .iter()
            .map(|m| m.target().to_path_buf())
            .collect()
    }

    /// Whether every tracked mount has been released
    pub fn is_empty(&self) -> bool {
        self.mounts.borrow().is_empty()
    }
}

/// Mount points currently listed in `/proc/self/mountinfo`
pub fn mounted_targets() -> Result<Vec<PathBuf>> {
    let content = std::fs::read_to_string("/proc/self/mountinfo")
        .map_err(EnvironmentError::MountTable)?;
    Ok(parse_mountinfo_targets(&content))
}

/// Whether `path` is currently a mount point
pub fn is_mount_point(path: &Path) -> Result<bool> {
    Ok(mounted_targets()?.iter().any(|target| target == path))
}

/// Extract mount points (fifth field) from mountinfo content
pub fn parse_mountinfo_targets(content: &str) -> Vec<PathBuf> {
    content
        .lines()
        .filter_map(|line| line.split(' ').nth(4))
        .map(|field| PathBuf::from(unescape_mountinfo(field)))
        .collect()
}

/// Decode the `\NNN` octal escapes the kernel uses for space, tab, newline and backslash
fn unescape_mountinfo(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = std::str::from_utf8(&bytes[i + 1..i + 4]).ok();
            if let Some(value) = digits.and_then(|d| u8::from_str_radix(d, 8).ok()) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
