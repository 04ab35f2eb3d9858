//! Per-request scratch directories.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Removes a workspace directory. Swappable so tests can observe or fail
/// the cleanup.
pub type CleanupHook = Arc<dyn Fn(&Path) -> io::Result<()> + Send + Sync>;

pub fn remove_dir_all_hook() -> CleanupHook {
    Arc::new(|path: &Path| std::fs::remove_dir_all(path))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CleanupMode {
    /// Hand the removal to the blocking pool and return immediately.
    Background,
    /// Remove before `drop` returns.
    Inline,
}

/// An exclusively owned, uniquely named directory that is removed exactly
/// once when the guard is dropped, on every exit path including unwinding.
///
/// Cleanup failures are logged and never reported to the owner.
pub struct ScratchWorkspace {
    path: PathBuf,
    hook: Option<CleanupHook>,
    mode: CleanupMode,
}

impl ScratchWorkspace {
    /// Create `<root>/<prefix>-<uuid>`; cleanup runs in the background.
    pub fn create(root: &Path, prefix: &str, hook: CleanupHook) -> io::Result<Self> {
        Self::create_with_mode(root, prefix, hook, CleanupMode::Background)
    }

    /// Like [`create`](Self::create), but cleanup finishes before the guard
    /// is gone. Used for nested directories whose parent may be removed
    /// right after.
    pub fn create_scoped(root: &Path, prefix: &str) -> io::Result<Self> {
        Self::create_with_mode(root, prefix, remove_dir_all_hook(), CleanupMode::Inline)
    }

    fn create_with_mode(root: &Path, prefix: &str, hook: CleanupHook, mode: CleanupMode) -> io::Result<Self> {
        let path = root.join(format!("{prefix}-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(root)?;
        // create_dir, not create_dir_all: an existing directory means a
        // name collision and must not be shared.
        std::fs::create_dir(&path)?;
        debug!(path = %path.display(), "scratch workspace created");
        Ok(Self {
            path,
            hook: Some(hook),
            mode,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn join(&self, name: impl AsRef<Path>) -> PathBuf {
        self.path.join(name)
    }
}

impl fmt::Debug for ScratchWorkspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScratchWorkspace")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .finish()
    }
}

fn run_cleanup(hook: &CleanupHook, path: &Path) {
    match hook(path) {
        Ok(()) => debug!(path = %path.display(), "scratch workspace removed"),
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove scratch workspace"),
    }
}

impl Drop for ScratchWorkspace {
    fn drop(&mut self) {
        let Some(hook) = self.hook.take() else {
            return;
        };
        let path = std::mem::take(&mut self.path);

        if self.mode == CleanupMode::Background {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn_blocking(move || run_cleanup(&hook, &path));
                return;
            }
        }
        run_cleanup(&hook, &path);
    }
}
