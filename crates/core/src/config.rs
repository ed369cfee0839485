//! Lifecycle settings
//!
//! Host paths and package lists used by the environment cloner and the overlay
//! upgrader. Every field has a default matching a standard Ubuntu build host, so
//! an empty JSON object is a valid settings file.

use crate::errors::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

/// Environment variable overriding [`LifecycleSettings::host_root`]
pub const HOST_ROOT_ENV: &str = "ROCKCRAFT_HOST_ROOT";

fn default_host_root() -> PathBuf {
    PathBuf::from("/")
}

fn default_apt_config_dir() -> PathBuf {
    PathBuf::from("etc/apt")
}

fn default_resolv_conf() -> PathBuf {
    PathBuf::from("etc/resolv.conf")
}

fn default_dev_dir() -> PathBuf {
    PathBuf::from("dev")
}

fn default_tmpfs_size() -> String {
    "50%".to_string()
}

fn default_trust_packages() -> Vec<String> {
    vec!["ca-certificates".to_string()]
}

fn default_true() -> bool {
    true
}

/// Settings for the privileged environment-preparation hooks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LifecycleSettings {
    /// Root of the build host; all host paths below are relative to it
    #[serde(default = "default_host_root")]
    pub host_root: PathBuf,

    /// Package manager configuration directory cloned into the rootfs
    #[serde(default = "default_apt_config_dir")]
    pub apt_config_dir: PathBuf,

    /// DNS resolver configuration file copied into the rootfs
    #[serde(default = "default_resolv_conf")]
    pub resolv_conf: PathBuf,

    /// Device-node directory bind-mounted into the rootfs
    #[serde(default = "default_dev_dir")]
    pub dev_dir: PathBuf,

    /// tmpfs `size=` option for cloned directories. The required size is not
    /// computed from the source tree.
    #[serde(default = "default_tmpfs_size")]
    pub tmpfs_size: String,

    /// Packages installed in the chroot before the index refresh
    #[serde(default = "default_trust_packages")]
    pub trust_packages: Vec<String>,

    /// Register the apt configuration clone hooks
    #[serde(default = "default_true")]
    pub clone_apt_config: bool,

    /// Register the overlay upgrade hook
    #[serde(default = "default_true")]
    pub upgrade_overlay: bool,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            host_root: default_host_root(),
            apt_config_dir: default_apt_config_dir(),
            resolv_conf: default_resolv_conf(),
            dev_dir: default_dev_dir(),
            tmpfs_size: default_tmpfs_size(),
            trust_packages: default_trust_packages(),
            clone_apt_config: true,
            upgrade_overlay: true,
        }
    }
}

impl LifecycleSettings {
    /// Parse settings from a JSON document and validate them
    pub fn from_json_str(content: &str) -> Result<Self> {
        let settings: LifecycleSettings =
            serde_json::from_str(content).map_err(|e| ConfigError::Parsing {
                message: format!("JSON parsing error: {}", e),
            })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a JSON file
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn from_file(path: &Path) -> Result<Self> {
        debug!("Loading lifecycle settings from {}", path.display());
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_json_str(&content)
    }

    /// Apply environment overrides (`ROCKCRAFT_HOST_ROOT`)
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(root) = std::env::var(HOST_ROOT_ENV) {
            if !root.is_empty() {
                debug!("Host root overridden from {}: {}", HOST_ROOT_ENV, root);
                self.host_root = PathBuf::from(root);
            }
        }
        self
    }

    /// Host-side path for one of the relative settings paths
    pub fn host_path(&self, relative: &Path) -> PathBuf {
        self.host_root.join(relative)
    }

    fn validate(&self) -> Result<()> {
        for (name, path) in [
            ("aptConfigDir", &self.apt_config_dir),
            ("resolvConf", &self.resolv_conf),
            ("devDir", &self.dev_dir),
        ] {
            if path.is_absolute() {
                return Err(ConfigError::Validation {
                    message: format!(
                        "{} must be relative to the host root, got {}",
                        name,
                        path.display()
                    ),
                }
                .into());
            }
        }
        if self.tmpfs_size.trim().is_empty() {
            return Err(ConfigError::Validation {
                message: "tmpfsSize must not be empty".to_string(),
            }
            .into());
        }
        Ok(())
    }
}
