//! Package upgrade of the overlay rootfs
//!
//! Runs before the overlay phase: the host's resolver configuration is copied
//! in, `/dev` is bind-mounted, and the package index is refreshed and upgraded
//! inside a chroot. The result lands in the overlay layer of the image.

use crate::config::LifecycleSettings;
use crate::errors::Result;
use crate::hooks::HookRegistry;
use crate::mount::MountGuard;
use crate::process::{argv, CommandRunner};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{error, info, instrument};

/// Refreshes and upgrades the packages of a rootfs
#[derive(Clone)]
pub struct OverlayUpgrader {
    runner: Rc<dyn CommandRunner>,
    resolv_conf: PathBuf,
    dev_source: PathBuf,
    settings: LifecycleSettings,
}

impl OverlayUpgrader {
    pub fn new(runner: Rc<dyn CommandRunner>, settings: &LifecycleSettings) -> Self {
        Self {
            runner,
            resolv_conf: settings.host_path(&settings.resolv_conf),
            dev_source: settings.host_path(&settings.dev_dir),
            settings: settings.clone(),
        }
    }

    /// Upgrade the packages installed in `rootfs_dir`
    ///
    /// The `/dev` bind mount is released even when a chroot command fails; in
    /// that case the chroot error is returned and an unmount failure is only
    /// logged.
    #[instrument(skip_all, fields(rootfs = %rootfs_dir.display()))]
    pub fn upgrade(&self, rootfs_dir: &Path) -> Result<()> {
        info!("Refreshing packages in {}", rootfs_dir.display());

        self.runner.run(&argv([
            OsStr::new("cp"),
            self.resolv_conf.as_os_str(),
            rootfs_dir.join(&self.settings.resolv_conf).as_os_str(),
        ]))?;

        let dev = MountGuard::bind(
            self.runner.clone(),
            &self.dev_source,
            &rootfs_dir.join(&self.settings.dev_dir),
        )?;

        match self.run_package_updates(rootfs_dir) {
            Ok(()) => dev.release(),
            Err(e) => {
                if let Err(release_error) = dev.release() {
                    error!(
                        "Failed to unmount /dev after package upgrade failure: {}",
                        release_error
                    );
                }
                Err(e)
            }
        }
    }

    fn run_package_updates(&self, rootfs_dir: &Path) -> Result<()> {
        let mut install = vec!["apt-get", "install", "-y"];
        install.extend(self.settings.trust_packages.iter().map(String::as_str));

        for command in [install, vec!["apt-get", "update"], vec!["apt-get", "upgrade", "-y"]] {
            let mut chroot = argv([OsStr::new("chroot"), rootfs_dir.as_os_str()]);
            chroot.extend(command.into_iter().map(str::to_string));
            self.runner.run(&chroot)?;
        }
        Ok(())
    }

    /// Register the upgrade as a prologue hook against `rootfs_dir`
    pub fn register(self, registry: &mut HookRegistry, rootfs_dir: &Path) {
        let rootfs_dir = rootfs_dir.to_path_buf();
        registry.register_prologue("upgrade-overlay-packages", move |_| {
            self.upgrade(&rootfs_dir)
        });
    }
}
