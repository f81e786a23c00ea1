//! Scoped temporary directories. Every directory name carries the owning
//! process id so a later startup can sweep residue left by a crash.

use std::io;
use std::str::FromStr;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::path::AbsolutePath;

/// Hands out scoped directories under a single root.
pub struct TempManager {
    root: AbsolutePath,
    pid: u32,
}

impl TempManager {
    pub fn new(root: AbsolutePath) -> io::Result<Self> {
        std::fs::create_dir_all(root.as_std())?;
        Ok(Self {
            root,
            pid: std::process::id(),
        })
    }

    pub fn root(&self) -> &AbsolutePath {
        &self.root
    }

    /// Creates a fresh directory named `{pid}-{uuid}-{purpose}` and returns a
    /// guard that deletes it on drop.
    pub fn scoped(&self, purpose: &str) -> io::Result<TempDir> {
        let name = format!("{}-{}-{}", self.pid, Uuid::new_v4().simple(), purpose);
        let path = self.root.join(&name);
        std::fs::create_dir_all(path.as_std())?;
        Ok(TempDir {
            path,
            released: false,
        })
    }

    /// Deletes children whose pid prefix no longer names a live process.
    /// Called once at startup, before any scoped dir is created.
    pub fn cleanup_stale(&self) -> io::Result<usize> {
        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::new(),
        );

        let mut removed = 0;
        for entry in std::fs::read_dir(self.root.as_std())? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(owner) = name.split('-').next().and_then(|p| u32::from_str(p).ok()) else {
                continue;
            };

            if owner == self.pid || system.process(Pid::from_u32(owner)).is_some() {
                continue;
            }

            debug!("removing stale temp dir {name} (pid {owner} is gone)");
            if let Err(err) = std::fs::remove_dir_all(entry.path()) {
                warn!("could not remove stale temp dir {name}: {err}");
            } else {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// A directory removed when the guard drops, unless `keep` was called.
pub struct TempDir {
    path: AbsolutePath,
    released: bool,
}

impl TempDir {
    pub fn path(&self) -> &AbsolutePath {
        &self.path
    }

    /// Detaches the directory from the guard; the caller now owns it.
    pub fn keep(mut self) -> AbsolutePath {
        self.released = true;
        self.path.clone()
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = std::fs::remove_dir_all(self.path.as_std()) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!("failed to remove temp dir {}: {err}", self.path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (tempfile::TempDir, TempManager) {
        let outer = tempfile::tempdir().unwrap();
        let root = AbsolutePath::from_std(outer.path().to_path_buf()).unwrap();
        let manager = TempManager::new(root).unwrap();
        (outer, manager)
    }

    #[test]
    fn scoped_dir_is_removed_on_drop() {
        let (_outer, manager) = manager();
        let path = {
            let scoped = manager.scoped("extract").unwrap();
            assert!(scoped.path().exists());
            scoped.path().clone()
        };
        assert!(!path.exists());
    }

    #[test]
    fn keep_detaches_the_guard() {
        let (_outer, manager) = manager();
        let scoped = manager.scoped("staging").unwrap();
        let path = scoped.keep();
        assert!(path.exists());
    }

    #[test]
    fn names_carry_pid_and_purpose() {
        let (_outer, manager) = manager();
        let scoped = manager.scoped("download").unwrap();
        let name = scoped.path().file_name().unwrap().to_string();
        assert!(name.starts_with(&format!("{}-", std::process::id())));
        assert!(name.ends_with("-download"));
    }

    #[test]
    fn cleanup_removes_dead_pid_dirs_only() {
        let (_outer, manager) = manager();

        // A pid that cannot exist on any sane system.
        let dead = manager.root().join("4294967294-deadbeef-extract");
        std::fs::create_dir_all(dead.as_std()).unwrap();

        // Our own pid must survive the sweep.
        let live = manager.scoped("live").unwrap();

        // Unrelated names are ignored.
        let unrelated = manager.root().join("not-a-temp-dir");
        std::fs::create_dir_all(unrelated.as_std()).unwrap();

        let removed = manager.cleanup_stale().unwrap();
        assert_eq!(removed, 1);
        assert!(!dead.exists());
        assert!(live.path().exists());
        assert!(unrelated.exists());
    }
}
