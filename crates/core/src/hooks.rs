//! Run-scoped hook registry
//!
//! Callbacks registered here are fired by the step engine: prologue hooks
//! immediately before the pipeline's overlay phase, epilogue hooks right after
//! its final phase. Registration is additive and ordered; hooks of the same
//! phase fire in registration order. A registry belongs to a single lifecycle
//! run and is dropped with it, so registrations never leak between runs.

use crate::errors::Result;
use crate::step::ProjectInfo;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, error, instrument};

/// Extension point at which a hook fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookPhase {
    /// Before the overlay phase of the pipeline
    Prologue,
    /// After the final phase of the pipeline
    Epilogue,
}

impl HookPhase {
    /// Get the phase name as string
    pub fn as_str(&self) -> &'static str {
        match self {
            HookPhase::Prologue => "prologue",
            HookPhase::Epilogue => "epilogue",
        }
    }
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Side-effecting callback invoked with the project metadata
pub type HookCallback = Box<dyn FnMut(&ProjectInfo) -> Result<()>>;

struct Registration {
    phase: HookPhase,
    name: String,
    callback: HookCallback,
}

/// Ordered list of (phase, callback) registrations for one run
#[derive(Default)]
pub struct HookRegistry {
    registrations: Vec<Registration>,
}

impl HookRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a callback for `phase`
    pub fn register<F>(&mut self, phase: HookPhase, name: impl Into<String>, callback: F)
    where
        F: FnMut(&ProjectInfo) -> Result<()> + 'static,
    {
        let name = name.into();
        debug!("Registering {} hook '{}'", phase, name);
        self.registrations.push(Registration {
            phase,
            name,
            callback: Box::new(callback),
        });
    }

    /// Append a prologue callback
    pub fn register_prologue<F>(&mut self, name: impl Into<String>, callback: F)
    where
        F: FnMut(&ProjectInfo) -> Result<()> + 'static,
    {
        self.register(HookPhase::Prologue, name, callback);
    }

    /// Append an epilogue callback
    pub fn register_epilogue<F>(&mut self, name: impl Into<String>, callback: F)
    where
        F: FnMut(&ProjectInfo) -> Result<()> + 'static,
    {
        self.register(HookPhase::Epilogue, name, callback);
    }

    /// Invoke every callback registered for `phase`, in registration order
    ///
    /// Stops at the first failing callback and returns its error unchanged.
    #[instrument(skip_all, fields(phase = %phase))]
    pub fn fire(&mut self, phase: HookPhase, project: &ProjectInfo) -> Result<()> {
        for registration in self.registrations.iter_mut().filter(|r| r.phase == phase) {
            debug!("Firing {} hook '{}'", phase, registration.name);
            if let Err(e) = (registration.callback)(project) {
                error!("{} hook '{}' failed: {}", phase, registration.name, e);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Names of the callbacks registered for `phase`, in firing order
    pub fn names(&self, phase: HookPhase) -> Vec<&str> {
        self.registrations
            .iter()
            .filter(|r| r.phase == phase)
            .map(|r| r.name.as_str())
            .collect()
    }

    /// Total number of registrations
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// Whether nothing has been registered
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("prologue", &self.names(HookPhase::Prologue))
            .field("epilogue", &self.names(HookPhase::Epilogue))
            .finish()
    }
}
