//! Filesystem primitives for assembling task sandbox directories: idempotent
//! directory creation, hardlink-with-copy-fallback, symlink replication, and
//! ownership/permission propagation.
//!
//! Everything here operates directly on a shared, mutable host filesystem, so
//! each primitive is written to tolerate re-entry: creating something that a
//! previous run already created is success, not an error.

use std::io;
use std::path::Path;

use fs_err as fs;
use tracing::{debug, warn};

/// Create a directory and any missing parents with the given creation mode.
///
/// Idempotent: an existing directory at `path` is success, while a foreign
/// non-directory object at `path` is an error. The applied mode is subject to
/// the process umask; callers that need exact bits re-apply them with
/// [`set_mode`] afterwards.
#[cfg(unix)]
pub fn ensure_dir(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(path)
}

/// Create a directory and any missing parents.
///
/// The creation mode is ignored on platforms without unix permission bits.
#[cfg(not(unix))]
pub fn ensure_dir(path: &Path, mode: u32) -> io::Result<()> {
    let _ = mode;
    fs::create_dir_all(path)
}

/// Returns `true` if `path` does not exist, or exists as a directory with no
/// entries.
///
/// Used to decide whether a shared directory still needs to be linked into a
/// sandbox: a populated destination means the work was already done, and any
/// probe failure is treated the same way so an unreadable destination is never
/// clobbered.
pub fn missing_or_empty(path: &Path) -> bool {
    match fs::read_dir(path) {
        Ok(mut entries) => entries.next().is_none(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => true,
        Err(_) => false,
    }
}

/// Link the shared directory `src` into a sandbox at `dst` via a symlink.
///
/// A pre-existing directory at `dst` is replaced by the link; `remove_dir`
/// refuses to remove a populated directory, so only an empty leftover (e.g.
/// from a build whose link vanished across a host restart) can be displaced.
#[cfg(unix)]
pub fn link_dir(src: &Path, dst: &Path) -> io::Result<()> {
    match std::os::unix::fs::symlink(src, dst) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            fs::remove_dir(dst)?;
            std::os::unix::fs::symlink(src, dst)
        }
        Err(err) => Err(err),
    }
}

/// Link the shared directory `src` into a sandbox at `dst` via a directory
/// symlink.
#[cfg(windows)]
pub fn link_dir(src: &Path, dst: &Path) -> io::Result<()> {
    match std::os::windows::fs::symlink_dir(src, dst) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            fs::remove_dir(dst)?;
            std::os::windows::fs::symlink_dir(src, dst)
        }
        Err(err) => Err(err),
    }
}

/// Recreate a symlink pointing at `target`.
///
/// An existing entry at `dst` is treated as the link having been created by a
/// previous run.
#[cfg(unix)]
pub fn replicate_symlink(target: &Path, dst: &Path) -> io::Result<()> {
    match std::os::unix::fs::symlink(target, dst) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(err) => Err(err),
    }
}

/// Recreate a symlink pointing at `target`.
#[cfg(windows)]
pub fn replicate_symlink(target: &Path, dst: &Path) -> io::Result<()> {
    match std::os::windows::fs::symlink_file(target, dst) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(err) => Err(err),
    }
}

/// Hard-link `src` to `dst`, falling back to a byte copy when linking is not
/// possible (for example across a filesystem boundary).
///
/// After either strategy, `dst` is given the source's numeric ownership and
/// permission bits, so the entry appears to the task exactly as it does on
/// the host regardless of which strategy was used.
pub fn link_or_copy(src: &Path, dst: &Path, uid: u32, gid: u32, mode: u32) -> io::Result<()> {
    if let Err(err) = fs::hard_link(src, dst) {
        debug!(
            "Failed to hard link `{}` to `{}` ({err}), copying instead",
            src.display(),
            dst.display()
        );
        fs::copy(src, dst)?;
    }
    set_owner(dst, uid, gid)?;
    set_mode(dst, mode)
}

/// Assign numeric ownership of `path`.
///
/// Assigning arbitrary owners requires privilege. Without it the current
/// ownership is retained and a diagnostic is emitted: on a single-user host,
/// ownership fidelity is a best-effort property, not a build failure.
#[cfg(unix)]
pub fn set_owner(path: &Path, uid: u32, gid: u32) -> io::Result<()> {
    match std::os::unix::fs::chown(path, Some(uid), Some(gid)) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
            warn!(
                "Ownership not propagated to `{}` (wanted {uid}:{gid}): {err}",
                path.display()
            );
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Assign numeric ownership of `path`. No-op on platforms without unix
/// ownership.
#[cfg(not(unix))]
pub fn set_owner(path: &Path, uid: u32, gid: u32) -> io::Result<()> {
    let _ = (path, uid, gid);
    Ok(())
}

/// Set the permission bits of `path` exactly, independent of the umask that
/// was in effect when it was created.
#[cfg(unix)]
pub fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

/// Set the permission bits of `path`. No-op on platforms without unix
/// permission bits.
#[cfg(not(unix))]
pub fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    let _ = (path, mode);
    Ok(())
}

/// The numeric owner and group of a file.
#[cfg(unix)]
pub fn owner(metadata: &std::fs::Metadata) -> (u32, u32) {
    use std::os::unix::fs::MetadataExt;

    (metadata.uid(), metadata.gid())
}

/// The numeric owner and group of a file. Always root on platforms without
/// unix ownership.
#[cfg(not(unix))]
pub fn owner(metadata: &std::fs::Metadata) -> (u32, u32) {
    let _ = metadata;
    (0, 0)
}

/// The permission bits of a file, including the setuid/setgid/sticky bits.
#[cfg(unix)]
pub fn mode_bits(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;

    metadata.permissions().mode() & 0o7777
}

/// The permission bits of a file. Always `0o777` on platforms without unix
/// permission bits.
#[cfg(not(unix))]
pub fn mode_bits(metadata: &std::fs::Metadata) -> u32 {
    let _ = metadata;
    0o777
}
