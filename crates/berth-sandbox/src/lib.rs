//! Per-task filesystem sandbox preparation.
//!
//! Given an allocation's shared directory and a task name, this crate derives
//! the task's directory layout ([`TaskDirPaths`]), materializes it on the host
//! ([`TaskDir::build`]), and optionally assembles a chroot-style root
//! filesystem by embedding configured host paths into the task root.
//!
//! The crate only prepares directory *contents*: process-level isolation
//! (namespaces, cgroups, mounts) is the job of whatever mechanism exposes the
//! tree to the task.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub use crate::task_dir::{TaskDir, TaskDirPaths};

mod embed;
mod task_dir;

/// Name of the directory shared by all tasks of an allocation, both under the
/// allocation root and as linked into each task root.
pub const SHARED_DIR_NAME: &str = "alloc";

/// Name of a secrets directory, under the shared directory and under each
/// task root.
pub const SECRETS_DIR_NAME: &str = "secrets";

/// Name of the allocation-wide log directory under the shared directory.
pub const LOGS_DIR_NAME: &str = "logs";

/// Name of a task's local scratch directory.
pub const LOCAL_DIR_NAME: &str = "local";

/// Name of a task's private directory.
pub const PRIVATE_DIR_NAME: &str = "private";

/// Name of a task's world-writable scratch directory.
pub const TMP_DIR_NAME: &str = "tmp";

/// Fixed subdirectories created in every task directory, with their creation
/// modes.
pub const TASK_DIRS: &[(&str, u32)] = &[(TMP_DIR_NAME, 0o1777)];

/// Creation mode for the task root and local directories. Effective access is
/// narrowed by each subdirectory's own policy, not by the creation call.
pub(crate) const PERMISSIVE_MODE: u32 = 0o777;

/// Exact mode applied to the secrets and private directories.
pub(crate) const RESTRICTED_MODE: u32 = 0o700;

/// A fatal failure while building a task directory or embedding host content
/// into it.
///
/// Missing optional sources and already-populated destinations are not
/// errors; everything else aborts the build at the first failure, leaving any
/// partially created state for the caller to discard or retry against.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to create directory `{}`", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        err: io::Error,
    },
    #[error("failed to link shared directory `{}` into `{}`", src.display(), dst.display())]
    LinkSharedDir {
        src: PathBuf,
        dst: PathBuf,
        #[source]
        err: io::Error,
    },
    #[error("failed to set permissions on `{}`", path.display())]
    SetPermissions {
        path: PathBuf,
        #[source]
        err: io::Error,
    },
    #[error("failed to inspect `{}`", path.display())]
    Stat {
        path: PathBuf,
        #[source]
        err: io::Error,
    },
    #[error("failed to read directory `{}`", path.display())]
    ReadDir {
        path: PathBuf,
        #[source]
        err: io::Error,
    },
    #[error("failed to resolve symlink `{}`", path.display())]
    ReadLink {
        path: PathBuf,
        #[source]
        err: io::Error,
    },
    #[error("failed to create symlink at `{}`", path.display())]
    Symlink {
        path: PathBuf,
        #[source]
        err: io::Error,
    },
    #[error("failed to embed `{}` into `{}`", src.display(), dst.display())]
    Embed {
        src: PathBuf,
        dst: PathBuf,
        #[source]
        err: io::Error,
    },
}
