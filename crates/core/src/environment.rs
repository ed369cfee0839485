//! Transient host configuration inside the build rootfs
//!
//! The build environment's package manager configuration is cloned into the
//! rootfs on a tmpfs for the duration of the pipeline, so the parts see the
//! host's sources (PPAs, proxies, pro credentials) without those files ever
//! being written to the overlay itself.

use crate::config::LifecycleSettings;
use crate::errors::{EnvironmentError, Result};
use crate::hooks::HookRegistry;
use crate::mount::{MountGuard, MountTracker};
use crate::process::{argv, CommandRunner};
use std::ffi::OsStr;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{debug, instrument, warn};

/// A tmpfs-backed copy of a host directory
#[derive(Debug)]
pub struct ClonedDirectory {
    source: PathBuf,
    mount: MountGuard,
}

impl ClonedDirectory {
    /// Directory that was cloned
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Location of the clone
    pub fn target(&self) -> &Path {
        self.mount.target()
    }

    /// Hand the underlying mount over, e.g. to a [`MountTracker`]
    pub fn into_mount(self) -> MountGuard {
        self.mount
    }
}

/// Creates and removes tmpfs clones of host directories
#[derive(Clone)]
pub struct EnvironmentCloner {
    runner: Rc<dyn CommandRunner>,
    tmpfs_size: String,
}

impl EnvironmentCloner {
    /// Create a cloner whose tmpfs mounts use the given `size=` option
    pub fn new(runner: Rc<dyn CommandRunner>, tmpfs_size: impl Into<String>) -> Self {
        Self {
            runner,
            tmpfs_size: tmpfs_size.into(),
        }
    }

    /// Clone `source` onto a fresh tmpfs at `target`
    ///
    /// Anything already at `target` is removed first, without backup.
    #[instrument(skip_all, fields(source = %source.display(), target = %target.display()))]
    pub fn clone_directory(&self, source: &Path, target: &Path) -> Result<ClonedDirectory> {
        if target.symlink_metadata().is_ok() {
            debug!("Removing existing {}", target.display());
            remove_path(target).map_err(|e| prepare_error(target, e))?;
        }

        fs::create_dir_all(target).map_err(|e| prepare_error(target, e))?;

        let metadata = fs::metadata(source).map_err(|e| prepare_error(source, e))?;
        std::os::unix::fs::chown(target, Some(metadata.uid()), Some(metadata.gid()))
            .map_err(|e| prepare_error(target, e))?;
        fs::set_permissions(target, metadata.permissions())
            .map_err(|e| prepare_error(target, e))?;

        let mount = MountGuard::tmpfs(self.runner.clone(), target, &self.tmpfs_size)?;

        // Contents must keep mode, ownership and timestamps.
        self.runner.run(&argv([
            OsStr::new("cp"),
            OsStr::new("-prT"),
            source.as_os_str(),
            target.as_os_str(),
        ]))?;

        Ok(ClonedDirectory {
            source: source.to_path_buf(),
            mount,
        })
    }

    /// Unmount a clone; consumes it so it cannot be removed twice
    #[instrument(skip_all, fields(target = %clone.target().display()))]
    pub fn remove_clone(&self, clone: ClonedDirectory) -> Result<()> {
        clone.into_mount().release()
    }
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    if path.symlink_metadata()?.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

fn prepare_error(path: &Path, source: std::io::Error) -> EnvironmentError {
    EnvironmentError::Prepare {
        path: path.to_path_buf(),
        source,
    }
}

/// Register hooks cloning the host's apt configuration into `rootfs_dir`
///
/// The prologue mounts the clone and parks it in `tracker`; the epilogue
/// unmounts it once every pipeline phase has finished.
pub fn register_apt_config_clone(
    registry: &mut HookRegistry,
    cloner: EnvironmentCloner,
    tracker: MountTracker,
    settings: &LifecycleSettings,
    rootfs_dir: &Path,
) {
    let host_apt_dir = settings.host_path(&settings.apt_config_dir);
    let rootfs_apt_dir = rootfs_dir.join(&settings.apt_config_dir);

    let prologue_target = rootfs_apt_dir.clone();
    let prologue_tracker = tracker.clone();
    registry.register_prologue("clone-apt-config", move |_| {
        debug!(
            "Overlay prologue: cloning {} as tmpfs at {}",
            host_apt_dir.display(),
            prologue_target.display()
        );
        let clone = cloner.clone_directory(&host_apt_dir, &prologue_target)?;
        prologue_tracker.track(clone.into_mount());
        Ok(())
    });

    registry.register_epilogue("remove-apt-config-clone", move |_| {
        debug!("Overlay epilogue: unmounting {}", rootfs_apt_dir.display());
        if !tracker.release(&rootfs_apt_dir)? {
            warn!(
                "No apt configuration clone mounted at {}",
                rootfs_apt_dir.display()
            );
        }
        Ok(())
    });
}
