//! Embedding of host paths into a task's chroot.
//!
//! The chroot spec is declarative: each `(host source, relative destination)`
//! entry is independent, optional on the host, and materialized by hardlink
//! where possible and byte copy where not. Re-running the algorithm over the
//! same spec is safe; content embedded by a previous run is left untouched.

use std::io;
use std::path::{Path, PathBuf};

use fs_err as fs;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::task_dir::TaskDirPaths;
use crate::{Error, PERMISSIVE_MODE};

/// Materialize every entry of a chroot spec inside the task root.
///
/// Traversal is breadth-first: subdirectories discovered while listing a
/// source are deferred into the next level and processed only after every
/// entry at the current level. That bounds the iteration count by directory
/// depth rather than total entry count, and means a fatal error in one
/// subtree surfaces only after its siblings at the same depth were handled.
/// The first fatal error aborts the whole call; nothing already embedded is
/// undone.
pub(crate) fn embed(
    paths: &TaskDirPaths,
    entries: &FxHashMap<PathBuf, PathBuf>,
) -> Result<(), Error> {
    let mut level = entries.clone();
    while !level.is_empty() {
        let mut deferred = FxHashMap::default();
        for (source, dest) in &level {
            embed_entry(paths, source, dest, &mut deferred)?;
        }
        level = deferred;
    }
    Ok(())
}

fn embed_entry(
    paths: &TaskDirPaths,
    source: &Path,
    dest: &Path,
    deferred: &mut FxHashMap<PathBuf, PathBuf>,
) -> Result<(), Error> {
    if paths.skip.contains(source) {
        trace!("Skipping excluded host path `{}`", source.display());
        return Ok(());
    }

    // Entries describe optional host content; a source absent from this host
    // is normal.
    let metadata = match fs::metadata(source) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            trace!("Skipping missing host path `{}`", source.display());
            return Ok(());
        }
        Err(err) => {
            return Err(Error::Stat {
                path: source.to_path_buf(),
                err,
            });
        }
    };

    if metadata.is_dir() {
        embed_dir(paths, source, dest, &metadata, deferred)
    } else if metadata.is_file() {
        embed_file(paths, source, dest, &metadata)
    } else {
        // Devices, sockets and other irregular entries cannot be replicated
        // into the sandbox. Skipped wherever they appear.
        debug!("Skipping irregular host path `{}`", source.display());
        Ok(())
    }
}

/// Embed a single regular file at its destination under the task root,
/// synthesizing the destination's parent chain.
fn embed_file(
    paths: &TaskDirPaths,
    source: &Path,
    dest: &Path,
    metadata: &std::fs::Metadata,
) -> Result<(), Error> {
    if let Some(parent) = dest.parent() {
        let parent = paths.task_dir.join(parent);
        berth_fs::ensure_dir(&parent, PERMISSIVE_MODE)
            .map_err(|err| Error::CreateDir { path: parent, err })?;
    }

    let task_entry = paths.task_dir.join(dest);
    trace!(
        "Embedding `{}` at `{}`",
        source.display(),
        task_entry.display()
    );
    let (uid, gid) = berth_fs::owner(metadata);
    berth_fs::link_or_copy(
        source,
        &task_entry,
        uid,
        gid,
        berth_fs::mode_bits(metadata),
    )
    .map_err(|err| Error::Embed {
        src: source.to_path_buf(),
        dst: task_entry,
        err,
    })
}

/// Embed the immediate entries of a host directory, deferring subdirectories
/// into the next traversal level.
fn embed_dir(
    paths: &TaskDirPaths,
    source: &Path,
    dest: &Path,
    metadata: &std::fs::Metadata,
    deferred: &mut FxHashMap<PathBuf, PathBuf>,
) -> Result<(), Error> {
    let dest_dir = paths.task_dir.join(dest);
    // The destination directory mirrors the source's permission bits.
    berth_fs::ensure_dir(&dest_dir, berth_fs::mode_bits(metadata)).map_err(|err| {
        Error::CreateDir {
            path: dest_dir.clone(),
            err,
        }
    })?;

    let dir = fs::read_dir(source).map_err(|err| Error::ReadDir {
        path: source.to_path_buf(),
        err,
    })?;
    for entry in dir {
        let entry = entry.map_err(|err| Error::ReadDir {
            path: source.to_path_buf(),
            err,
        })?;
        let file_type = entry.file_type().map_err(|err| Error::Stat {
            path: entry.path(),
            err,
        })?;
        let host_entry = entry.path();
        let task_entry = dest_dir.join(entry.file_name());

        if file_type.is_dir() {
            deferred.insert(host_entry, dest.join(entry.file_name()));
            continue;
        }

        // Present from a previous run, e.g. a restarted task: never
        // overwritten or re-validated.
        if fs::symlink_metadata(&task_entry).is_ok() {
            trace!("Skipping already-embedded `{}`", task_entry.display());
            continue;
        }

        if file_type.is_symlink() {
            let target = fs::read_link(&host_entry).map_err(|err| Error::ReadLink {
                path: host_entry.clone(),
                err,
            })?;
            berth_fs::replicate_symlink(&target, &task_entry).map_err(|err| Error::Symlink {
                path: task_entry.clone(),
                err,
            })?;
            continue;
        }

        if !file_type.is_file() {
            debug!("Skipping irregular host path `{}`", host_entry.display());
            continue;
        }

        let metadata = entry.metadata().map_err(|err| Error::Stat {
            path: host_entry.clone(),
            err,
        })?;
        let (uid, gid) = berth_fs::owner(&metadata);
        berth_fs::link_or_copy(
            &host_entry,
            &task_entry,
            uid,
            gid,
            berth_fs::mode_bits(&metadata),
        )
        .map_err(|err| Error::Embed {
            src: host_entry.clone(),
            dst: task_entry.clone(),
            err,
        })?;
    }

    Ok(())
}
