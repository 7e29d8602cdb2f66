//! Filesystem primitives with crash-safety: durable appends, the temp-file
//! plus rename replacement protocol, and the datafile/side-file
//! reconciliation performed before every load.
//!
//! The side file of `<name>` is `<name>~`. In a clean state the side file
//! never exists; it only survives a crash that happened mid-rewrite, and
//! the reconciliation rules below decide which of the two files wins.

use std::fs::{ self, File, OpenOptions };
use std::io::Write;
use std::path::{ Path, PathBuf };
use crate::error::{ Result, ResultExt };

/// Whether a file exists at `path`.
pub fn exists(path: &Path) -> bool {
    path.exists()
}

/// Reads the whole file as UTF-8.
pub fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .with_context(|| format!("can't read data file {}", path.display()))
}

/// Creates the directory (and its ancestors) if missing; idempotent.
pub fn ensure_directory_exists(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("can't create data directory {}", dir.display()))
}

/// Removes the file if it is present.
pub fn ensure_file_doesnt_exist(path: &Path) -> Result<()> {
    if exists(path) {
        fs::remove_file(path)
            .with_context(|| format!("can't remove file {}", path.display()))?;
    }

    Ok(())
}

/// The transient rewrite companion of a data file: `<name>~`.
pub fn side_file_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push("~");
    PathBuf::from(name)
}

/// Appends one line to the file with durability: open in append mode,
/// write, fsync, close.
pub fn append(path: &Path, line: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("can't open {} for appending", path.display()))?;

    file.write_all(line.as_bytes())
        .and_then(|_| file.write_all(b"\n"))
        .and_then(|_| file.sync_all())
        .with_context(|| format!("can't append to {}", path.display()))
}

/// Atomically replaces the file's contents: write the side file, fsync it,
/// then rename it over the primary. A crash at any point leaves either the
/// old contents or the new contents, never a mixture and never nothing.
pub fn write_and_replace(path: &Path, contents: &str) -> Result<()> {
    let side = side_file_path(path);

    ensure_file_doesnt_exist(&side)?;

    {
        let mut file = File::create(&side)
            .with_context(|| format!("can't create side file {}", side.display()))?;
        file.write_all(contents.as_bytes())
            .and_then(|_| file.sync_all())
            .with_context(|| format!("can't write side file {}", side.display()))?;
    }

    fs::rename(&side, path)
        .with_context(|| format!("can't rename {} into place", side.display()))?;

    // Make the rename itself durable where the platform allows syncing
    // directories; harmless elsewhere.
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    Ok(())
}

/// Reconciles the data file with its side file before a load:
///
/// - only the primary exists: the normal case, nothing to do;
/// - only the side file exists: a crash hit after the rewrite but before
///   the rename; the side file is complete, move it into place;
/// - both exist: a crash hit mid-rewrite; the side file is untrusted,
///   delete it and keep the primary;
/// - neither exists: start with an empty primary.
pub fn ensure_datafile_integrity(path: &Path) -> Result<()> {
    let side = side_file_path(path);

    match (exists(path), exists(&side)) {
        (true, false) => Ok(()),
        (false, true) => {
            debug!("recovering {} from its side file", path.display());
            fs::rename(&side, path)
                .with_context(|| format!("can't recover {} from side file", path.display()))
        }
        (true, true) => {
            warn!(
                "both {} and its side file exist; discarding the side file",
                path.display(),
            );
            ensure_file_doesnt_exist(&side)
        }
        (false, false) => {
            File::create(path)
                .and_then(|file| file.sync_all())
                .with_context(|| format!("can't create empty data file {}", path.display()))
        }
    }
}
