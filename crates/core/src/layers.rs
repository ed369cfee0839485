//! Layer diffing between the prime directory and the base layer
//!
//! Files primed by a part that are already present, unchanged, in the base
//! layer would only duplicate content in the resulting image layer. They are
//! removed from the prime directory before the layer is packed.
//!
//! A prime entry is removed when:
//! - it is a regular file and the base has a regular file with identical bytes
//! - it is a symlink and the base has a symlink with the identical target
//!
//! Directories are never removed, nor is anything absent from the base or with
//! differing content. Running the pruner twice has the same effect as once.

use crate::errors::{PruneError, Result};
use std::collections::BTreeSet;
use std::fs::{self, File, Metadata};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, instrument, trace, warn};

const CHUNK_SIZE: usize = 64 * 1024;

/// Remove from `prime_dir` every manifest entry that duplicates the base layer
///
/// `files` are paths relative to `prime_dir` (and `base_layer_dir`), as
/// recorded in the prime step state. Entries are visited in sorted order.
#[instrument(skip_all, fields(prime = %prime_dir.display(), base = %base_layer_dir.display()))]
pub fn prune_prime_files(
    prime_dir: &Path,
    files: &BTreeSet<String>,
    base_layer_dir: &Path,
) -> Result<()> {
    let mut removed = 0usize;
    for entry in files {
        let relative = manifest_path(entry)?;
        if has_symlinked_ancestor(prime_dir, &relative)?
            || has_symlinked_ancestor(base_layer_dir, &relative)?
        {
            warn!("Skipping {} (a parent directory is a symlink)", entry);
            continue;
        }
        let prime_path = prime_dir.join(&relative);
        let base_path = base_layer_dir.join(&relative);

        if is_duplicate(&prime_path, &base_path)? {
            debug!("Removing {} (identical in base layer)", entry);
            fs::remove_file(&prime_path).map_err(|e| comparison_error(&prime_path, e))?;
            removed += 1;
        }
    }
    debug!("Pruned {} of {} primed entries", removed, files.len());
    Ok(())
}

/// Reject manifest entries that would resolve outside the prime directory
fn manifest_path(entry: &str) -> Result<PathBuf> {
    let path = Path::new(entry);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes || entry.is_empty() {
        return Err(PruneError::InvalidManifestPath {
            path: entry.to_string(),
        }
        .into());
    }
    Ok(path.to_path_buf())
}

/// Whether any directory between `root` and the entry itself is a symlink
///
/// Such an entry would resolve outside `root`, possibly onto a host file.
fn has_symlinked_ancestor(root: &Path, relative: &Path) -> Result<bool> {
    let Some(parent) = relative.parent() else {
        return Ok(false);
    };
    let mut current = root.to_path_buf();
    for component in parent.components() {
        current.push(component);
        match symlink_metadata(&current)? {
            Some(meta) if meta.file_type().is_symlink() => return Ok(true),
            Some(_) => {}
            None => return Ok(false),
        }
    }
    Ok(false)
}

fn is_duplicate(prime_path: &Path, base_path: &Path) -> Result<bool> {
    let Some(prime_meta) = symlink_metadata(prime_path)? else {
        trace!("{} not in prime, skipping", prime_path.display());
        return Ok(false);
    };
    let Some(base_meta) = symlink_metadata(base_path)? else {
        return Ok(false);
    };

    let prime_type = prime_meta.file_type();
    let base_type = base_meta.file_type();

    if prime_type.is_symlink() && base_type.is_symlink() {
        let prime_target = fs::read_link(prime_path).map_err(|e| comparison_error(prime_path, e))?;
        let base_target = fs::read_link(base_path).map_err(|e| comparison_error(base_path, e))?;
        return Ok(prime_target == base_target);
    }

    if prime_type.is_file() && base_type.is_file() {
        if prime_meta.len() != base_meta.len() {
            return Ok(false);
        }
        return files_identical(prime_path, base_path);
    }

    Ok(false)
}

fn symlink_metadata(path: &Path) -> Result<Option<Metadata>> {
    match fs::symlink_metadata(path) {
        Ok(meta) => Ok(Some(meta)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(comparison_error(path, e).into()),
    }
}

fn files_identical(a: &Path, b: &Path) -> Result<bool> {
    let mut file_a = File::open(a).map_err(|e| comparison_error(a, e))?;
    let mut file_b = File::open(b).map_err(|e| comparison_error(b, e))?;
    let mut buf_a = vec![0u8; CHUNK_SIZE];
    let mut buf_b = vec![0u8; CHUNK_SIZE];

    loop {
        let read_a = read_chunk(&mut file_a, &mut buf_a).map_err(|e| comparison_error(a, e))?;
        let read_b = read_chunk(&mut file_b, &mut buf_b).map_err(|e| comparison_error(b, e))?;
        if read_a != read_b || buf_a[..read_a] != buf_b[..read_b] {
            return Ok(false);
        }
        if read_a == 0 {
            return Ok(true);
        }
    }
}

/// Fill `buf` as far as the file allows; a short count means end of file
fn read_chunk(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn comparison_error(path: &Path, source: io::Error) -> PruneError {
    PruneError::Comparison {
        path: path.to_path_buf(),
        source,
    }
}
