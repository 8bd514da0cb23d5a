#![forbid(unsafe_code)]

//! Best-effort removal of download artifacts.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tracing::{debug, warn};

/// Deletes `path` if it exists. A missing file is not a fault, and other
/// errors are logged and swallowed.
pub fn remove_artifact(path: &Path) {
    let removed = match fs::remove_file(path) {
        Err(err) if err.kind() == io::ErrorKind::IsADirectory => fs::remove_dir_all(path),
        other => other,
    };
    match removed {
        Ok(()) => debug!(path = %path.display(), "removed artifact"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "could not remove artifact"),
    }
}

/// Deletes every entry next to `path` named `<stem>.*`: subtitle sidecars,
/// `.part` files and format fragments the worker writes beside its output.
/// Artifact stems are unique per request, so nothing else can match.
pub fn remove_siblings(path: &Path) {
    let (Some(dir), Some(stem)) = (path.parent(), path.file_stem().and_then(|s| s.to_str())) else {
        return;
    };
    let prefix = format!("{stem}.");
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return,
        Err(err) => {
            warn!(dir = %dir.display(), error = %err, "could not list artifact directory");
            return;
        }
    };
    for entry in entries.flatten() {
        if entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(&prefix))
        {
            remove_artifact(&entry.path());
        }
    }
}

/// Shared handle that removes one artifact and its siblings exactly once, from whichever
/// termination path calls [`ArtifactCleanup::run`] first. Dropping the last
/// clone also runs it.
#[derive(Clone, Debug)]
pub struct ArtifactCleanup {
    inner: Arc<CleanupInner>,
}

#[derive(Debug)]
struct CleanupInner {
    path: PathBuf,
    done: AtomicBool,
}

impl ArtifactCleanup {
    pub fn new(path: PathBuf) -> Self {
        Self {
            inner: Arc::new(CleanupInner {
                path,
                done: AtomicBool::new(false),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Returns `true` for the call that actually performed the removal.
    pub fn run(&self) -> bool {
        self.inner.run()
    }

    #[cfg(test)]
    pub fn is_done(&self) -> bool {
        self.inner.done.load(Ordering::Acquire)
    }
}

impl CleanupInner {
    fn run(&self) -> bool {
        if self.done.swap(true, Ordering::AcqRel) {
            return false;
        }
        remove_artifact(&self.path);
        remove_siblings(&self.path);
        true
    }
}

impl Drop for CleanupInner {
    fn drop(&mut self) {
        self.run();
    }
}
