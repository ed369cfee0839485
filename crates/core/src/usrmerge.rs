//! Python plugin workaround for usrmerged bases
//!
//! On ubuntu@24.04 the python plugin primes a `lib64 -> lib` symlink. The base
//! layer already carries `/lib64` as part of the usrmerge layout, and the
//! primed symlink would shadow it in the final image.

use crate::errors::{PruneError, Result};
use crate::step::StepInfo;
use std::fs;
use std::io;
use std::path::Path;
use tracing::{debug, instrument, trace};

const AFFECTED_BASE: &str = "ubuntu@24.04";
const AFFECTED_PLUGIN: &str = "python";
const LIB64: &str = "lib64";

/// Remove the primed `lib64 -> lib` symlink of a python part on ubuntu@24.04
///
/// Any other base, plugin or manifest is left untouched.
#[instrument(skip_all, fields(prime = %step_info.prime_dir.display()))]
pub fn python_usrmerge_fix(step_info: &StepInfo) -> Result<()> {
    if step_info.project_info.base != AFFECTED_BASE {
        trace!("Base {} not affected", step_info.project_info.base);
        return Ok(());
    }

    let Some(state) = &step_info.state else {
        debug!("No step state recorded");
        return Ok(());
    };

    if state.plugin() != Some(AFFECTED_PLUGIN) {
        trace!("Plugin {:?} not affected", state.plugin());
        return Ok(());
    }

    if !state.files.contains(LIB64) {
        trace!("{} not in primed files", LIB64);
        return Ok(());
    }

    let lib64 = step_info.prime_dir.join(LIB64);
    match fs::read_link(&lib64) {
        Ok(target) if target == Path::new("lib") => {
            debug!("Removing {} -> lib", lib64.display());
            fs::remove_file(&lib64).map_err(|source| PruneError::Usrmerge {
                path: lib64.clone(),
                source,
            })?;
        }
        Ok(target) => trace!("{} points to {}, keeping", lib64.display(), target.display()),
        Err(e) if is_not_a_symlink(&e) => trace!("{} is not a symlink", lib64.display()),
        Err(e) => debug!("Cannot inspect {}, keeping: {}", lib64.display(), e),
    }
    Ok(())
}

/// `read_link` errors meaning there is simply no symlink at the path
fn is_not_a_symlink(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::InvalidInput | io::ErrorKind::NotFound
    )
}
