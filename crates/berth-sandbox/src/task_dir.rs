use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use tracing::debug;

use crate::{
    Error, LOCAL_DIR_NAME, LOGS_DIR_NAME, PERMISSIVE_MODE, PRIVATE_DIR_NAME, RESTRICTED_MODE,
    SECRETS_DIR_NAME, SHARED_DIR_NAME, TASK_DIRS, embed,
};

/// All of the host paths relevant to one task of an allocation.
///
/// Paths are derived once from the allocation directory and task name and
/// never recomputed; the isolation mechanism mounts or links them into the
/// task's runtime view as needed.
#[derive(Debug, Clone, Serialize)]
pub struct TaskDirPaths {
    /// The allocation directory shared by this task and its siblings.
    pub alloc_dir: PathBuf,

    /// The task's private root, `<alloc_dir>/<task_name>`.
    pub task_dir: PathBuf,

    /// The shared allocation directory, `<alloc_dir>/alloc`.
    pub shared_alloc_dir: PathBuf,

    /// The secrets directory under the shared allocation directory,
    /// `<alloc_dir>/alloc/secrets`.
    pub shared_alloc_secrets_dir: PathBuf,

    /// The allocation-wide log directory, `<alloc_dir>/alloc/logs`.
    pub log_dir: PathBuf,

    /// The shared allocation directory as seen inside the task root,
    /// `<task_dir>/alloc`.
    pub shared_task_dir: PathBuf,

    /// The shared secrets directory as seen inside the task root,
    /// `<task_dir>/alloc/secrets`.
    pub shared_task_secrets_dir: PathBuf,

    /// The task's local scratch directory, `<task_dir>/local`.
    pub local_dir: PathBuf,

    /// The task's secrets directory, `<task_dir>/secrets`.
    pub secrets_dir: PathBuf,

    /// The task's private directory, `<task_dir>/private`.
    pub private_dir: PathBuf,

    /// Host paths excluded from chroot embedding.
    #[serde(skip)]
    pub(crate) skip: FxHashSet<PathBuf>,
}

impl TaskDirPaths {
    /// Derive the full path set for `task_name` under `alloc_dir`.
    ///
    /// Pure path joining; callable before any directory exists. The
    /// client-wide allocation root is always excluded from embedding, so a
    /// chroot spec that happens to reference it cannot recurse the entire
    /// client state directory into a single task.
    pub fn resolve(client_alloc_root: &Path, alloc_dir: &Path, task_name: &str) -> Self {
        let task_dir = alloc_dir.join(task_name);
        let shared_alloc_dir = alloc_dir.join(SHARED_DIR_NAME);

        let mut skip = FxHashSet::default();
        skip.insert(client_alloc_root.to_path_buf());

        Self {
            alloc_dir: alloc_dir.to_path_buf(),
            shared_alloc_secrets_dir: shared_alloc_dir.join(SECRETS_DIR_NAME),
            log_dir: shared_alloc_dir.join(LOGS_DIR_NAME),
            shared_task_dir: task_dir.join(SHARED_DIR_NAME),
            shared_task_secrets_dir: task_dir.join(SHARED_DIR_NAME).join(SECRETS_DIR_NAME),
            local_dir: task_dir.join(LOCAL_DIR_NAME),
            secrets_dir: task_dir.join(SECRETS_DIR_NAME),
            private_dir: task_dir.join(PRIVATE_DIR_NAME),
            shared_alloc_dir,
            task_dir,
            skip,
        }
    }
}

/// The build lifecycle of one task's directory tree.
///
/// Construction only resolves paths; [`TaskDir::build`] materializes them.
/// A failed build leaves a partial tree behind: the caller either discards it
/// or re-invokes `build`, whose steps all tolerate pre-existing state.
///
/// `build` must not be invoked concurrently on the same instance. Only the
/// built flag is synchronized, so overlapping builds are undefined with
/// respect to filesystem state; sibling tasks are safe to build in parallel
/// because their task roots are disjoint.
#[derive(Debug)]
pub struct TaskDir {
    paths: TaskDirPaths,
    built: Mutex<bool>,
}

impl TaskDir {
    /// Resolve the path layout for `task_name` under `alloc_dir`. No
    /// directories are created until [`TaskDir::build`] is called.
    pub fn new(client_alloc_root: &Path, alloc_dir: &Path, task_name: &str) -> Self {
        Self {
            paths: TaskDirPaths::resolve(client_alloc_root, alloc_dir, task_name),
            built: Mutex::new(false),
        }
    }

    /// The resolved path layout.
    pub fn paths(&self) -> &TaskDirPaths {
        &self.paths
    }

    /// Whether a [`TaskDir::build`] call has completed successfully.
    pub fn is_built(&self) -> bool {
        *self.built.lock().unwrap()
    }

    /// A JSON snapshot of the path layout, for diagnostics.
    pub fn layout_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.paths)
    }

    /// Create the task's directory tree on the host.
    ///
    /// Creates the task root, local directory, and the fixed subdirectory
    /// set; links the shared allocation directory into the task root and
    /// embeds the `chroot` spec when `create_chroot` is set; and creates then
    /// hardens the secrets and private directories. Steps run in order and
    /// the first failure aborts the build.
    pub fn build(
        &self,
        create_chroot: bool,
        chroot: &FxHashMap<PathBuf, PathBuf>,
    ) -> Result<(), Error> {
        debug!(
            task_dir = %self.paths.task_dir.display(),
            local_dir = %self.paths.local_dir.display(),
            secrets_dir = %self.paths.secrets_dir.display(),
            create_chroot,
            "Building task directory"
        );

        make_dir(&self.paths.task_dir, PERMISSIVE_MODE)?;
        make_dir(&self.paths.local_dir, PERMISSIVE_MODE)?;

        for (name, mode) in TASK_DIRS {
            make_dir(&self.paths.task_dir.join(name), *mode)?;
        }

        // Only chroot isolation needs the shared directory inside the task
        // root; other isolation modes reach it via the host path. An existing
        // populated destination means a previous build already linked it.
        if create_chroot && berth_fs::missing_or_empty(&self.paths.shared_task_dir) {
            debug!(
                "Linking `{}` into `{}`",
                self.paths.shared_alloc_dir.display(),
                self.paths.shared_task_dir.display()
            );
            berth_fs::link_dir(&self.paths.shared_alloc_dir, &self.paths.shared_task_dir)
                .map_err(|err| Error::LinkSharedDir {
                    src: self.paths.shared_alloc_dir.clone(),
                    dst: self.paths.shared_task_dir.clone(),
                    err,
                })?;
        }

        // mkdir cannot create with exact bits under a restrictive umask, so
        // the intended mode is re-applied after creation.
        for dir in [&self.paths.secrets_dir, &self.paths.private_dir] {
            make_dir(dir, RESTRICTED_MODE)?;
            berth_fs::set_mode(dir, RESTRICTED_MODE).map_err(|err| Error::SetPermissions {
                path: dir.clone(),
                err,
            })?;
        }

        if create_chroot {
            embed::embed(&self.paths, chroot)?;
        }

        *self.built.lock().unwrap() = true;
        Ok(())
    }
}

fn make_dir(path: &Path, mode: u32) -> Result<(), Error> {
    berth_fs::ensure_dir(path, mode).map_err(|err| Error::CreateDir {
        path: path.to_path_buf(),
        err,
    })
}

#[cfg(test)]
mod tests {
    use fs_err as fs;
    use rustc_hash::FxHashMap;

    use super::*;

    fn alloc_fixture(root: &Path) -> PathBuf {
        // The allocation lifecycle above task directories is owned by a
        // separate collaborator; tests stand in for it.
        let alloc_dir = root.join("allocs/d4e9b6");
        fs::create_dir_all(alloc_dir.join(SHARED_DIR_NAME).join(SECRETS_DIR_NAME))
            .expect("Failed to create shared alloc dirs");
        fs::create_dir_all(alloc_dir.join(SHARED_DIR_NAME).join(LOGS_DIR_NAME))
            .expect("Failed to create log dir");
        alloc_dir
    }

    #[test]
    fn resolve_is_pure_and_contained() {
        let client_root = Path::new("/var/lib/berth/allocs");
        let alloc_dir = Path::new("/var/lib/berth/allocs/d4e9b6");

        let first = TaskDirPaths::resolve(client_root, alloc_dir, "web");
        let second = TaskDirPaths::resolve(client_root, alloc_dir, "web");

        assert_eq!(first.task_dir, second.task_dir);
        assert_eq!(first.secrets_dir, second.secrets_dir);
        assert_eq!(first.log_dir, second.log_dir);

        assert_eq!(first.task_dir, alloc_dir.join("web"));
        assert_eq!(first.shared_alloc_dir, alloc_dir.join("alloc"));
        assert_eq!(first.log_dir, alloc_dir.join("alloc/logs"));
        assert_eq!(first.shared_task_dir, alloc_dir.join("web/alloc"));
        assert_eq!(
            first.shared_task_secrets_dir,
            alloc_dir.join("web/alloc/secrets")
        );
        assert_eq!(first.local_dir, alloc_dir.join("web/local"));
        assert_eq!(first.secrets_dir, alloc_dir.join("web/secrets"));
        assert_eq!(first.private_dir, alloc_dir.join("web/private"));
        assert!(first.skip.contains(client_root));
    }

    #[test]
    fn build_creates_layout() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let alloc_dir = alloc_fixture(temp_dir.path());
        let task_dir = TaskDir::new(temp_dir.path(), &alloc_dir, "web");

        assert!(!task_dir.is_built());
        task_dir
            .build(false, &FxHashMap::default())
            .expect("Failed to build task dir");
        assert!(task_dir.is_built());

        let paths = task_dir.paths();
        assert!(paths.task_dir.is_dir());
        assert!(paths.local_dir.is_dir());
        assert!(paths.task_dir.join(crate::TMP_DIR_NAME).is_dir());
        assert!(paths.secrets_dir.is_dir());
        assert!(paths.private_dir.is_dir());
        // Without chroot isolation the shared dir is not linked in.
        assert!(!paths.shared_task_dir.exists());
    }

    #[cfg(unix)]
    #[test]
    fn build_hardens_secrets_and_private() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let alloc_dir = alloc_fixture(temp_dir.path());
        let task_dir = TaskDir::new(temp_dir.path(), &alloc_dir, "web");
        task_dir
            .build(false, &FxHashMap::default())
            .expect("Failed to build task dir");

        for dir in [&task_dir.paths().secrets_dir, &task_dir.paths().private_dir] {
            let metadata = fs::metadata(dir).expect("Failed to stat directory");
            assert_eq!(berth_fs::mode_bits(&metadata), 0o700);
        }
    }

    #[test]
    fn build_links_shared_dir_for_chroot() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let alloc_dir = alloc_fixture(temp_dir.path());
        let task_dir = TaskDir::new(temp_dir.path(), &alloc_dir, "web");

        task_dir
            .build(true, &FxHashMap::default())
            .expect("Failed to build task dir");

        let paths = task_dir.paths();
        // The shared dir is reachable through the task root.
        assert!(paths.shared_task_dir.join(crate::LOGS_DIR_NAME).is_dir());
        assert!(
            paths
                .shared_task_dir
                .join(crate::SECRETS_DIR_NAME)
                .is_dir()
        );
    }

    #[test]
    fn build_is_idempotent() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let alloc_dir = alloc_fixture(temp_dir.path());

        let host_src = temp_dir.path().join("host/etc");
        fs::create_dir_all(&host_src).expect("Failed to create host dir");
        fs::write(host_src.join("hosts"), b"127.0.0.1 localhost").expect("Failed to write file");

        let mut chroot = FxHashMap::default();
        chroot.insert(host_src.clone(), PathBuf::from("etc"));

        let task_dir = TaskDir::new(temp_dir.path(), &alloc_dir, "web");
        task_dir.build(true, &chroot).expect("First build failed");
        assert!(task_dir.is_built());

        let embedded = task_dir.paths().task_dir.join("etc/hosts");
        let before = fs::read(&embedded).expect("Failed to read embedded file");

        // A rebuild against the same spec succeeds and alters nothing.
        task_dir.build(true, &chroot).expect("Second build failed");
        let after = fs::read(&embedded).expect("Failed to re-read embedded file");
        assert_eq!(before, after);
        assert!(task_dir.is_built());
    }

    #[test]
    fn layout_json_snapshot() {
        let task_dir = TaskDir::new(
            Path::new("/var/lib/berth/allocs"),
            Path::new("/var/lib/berth/allocs/d4e9b6"),
            "web",
        );
        let snapshot = task_dir.layout_json().expect("Failed to serialize layout");
        assert!(snapshot.contains("\"task_dir\""));
        assert!(snapshot.contains("/var/lib/berth/allocs/d4e9b6/web"));
        // The skip set is internal state, not part of the snapshot.
        assert!(!snapshot.contains("skip"));
    }
}
