//! Error types and handling
//!
//! This module provides domain-specific error types for the lifecycle core.
//! Each subsystem (process execution, image resolution, environment cloning,
//! pruning, orchestration, settings) has its own error enum, and all of them
//! are wrapped in the main [`RockcraftError`] enum for unified propagation.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while executing external (usually privileged) commands
#[derive(Error, Debug)]
pub enum ProcessError {
    /// A command exited with a non-zero status or could not be spawned
    #[error("Command `{}` failed with exit code {exit_code}{}", argv.join(" "), format_stderr(stderr))]
    ExternalCommand {
        argv: Vec<String>,
        exit_code: i32,
        stderr: String,
    },

    /// An empty argument vector was handed to a runner
    #[error("Refusing to run an empty command")]
    EmptyCommand,
}

fn format_stderr(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(":\n{}", trimmed)
    }
}

/// Base image resolution errors
#[derive(Error, Debug)]
pub enum ImageError {
    /// The image service could not supply a base layer
    #[error("Failed to obtain base image '{base}': {reason}")]
    BaseResolution { base: String, reason: String },
}

/// Errors raised while preparing a cloned host directory
#[derive(Error, Debug)]
pub enum EnvironmentError {
    /// Filesystem operation on the clone source or target failed
    #[error("Failed to prepare clone target {}: {source}", path.display())]
    Prepare {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Reading the mount table failed
    #[error("Failed to read mount table: {0}")]
    MountTable(#[source] std::io::Error),
}

/// Errors raised while pruning primed files against the base layer
#[derive(Error, Debug)]
pub enum PruneError {
    /// Reading or removing a prime/base file failed
    #[error("Failed to compare {} against the base layer: {source}", path.display())]
    Comparison {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Manifest entry would resolve outside the prime directory
    #[error("Manifest entry escapes the prime directory: {path}")]
    InvalidManifestPath { path: String },

    /// Removing the python usrmerge symlink failed
    #[error("Failed to remove usrmerge symlink {}: {source}", path.display())]
    Usrmerge {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Lifecycle orchestration errors
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// An orchestrator operation was called out of order
    #[error("Cannot {operation} while lifecycle is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },
}

/// Settings loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Settings file parsing error
    #[error("Failed to parse lifecycle settings: {message}")]
    Parsing { message: String },

    /// Settings validation error
    #[error("Lifecycle settings validation error: {message}")]
    Validation { message: String },

    /// Settings file I/O error
    #[error("Failed to read lifecycle settings file")]
    Io(#[from] std::io::Error),
}

/// Main error enum wrapping all domain-specific errors
#[derive(Error, Debug)]
pub enum RockcraftError {
    /// External command errors
    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    /// Base image resolution errors
    #[error("Image error: {0}")]
    Image(#[from] ImageError),

    /// Host environment clone errors
    #[error("Environment error: {0}")]
    Environment(#[from] EnvironmentError),

    /// Prime pruning errors
    #[error("Prune error: {0}")]
    Prune(#[from] PruneError),

    /// Orchestration errors
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    /// Settings errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Convenience type alias for Results with RockcraftError
pub type Result<T> = std::result::Result<T, RockcraftError>;
