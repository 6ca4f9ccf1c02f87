//! Temporary directory management.
//!
//! The engine owns one base directory per run, with `objects/` for
//! spilled object bytes and `players/` for per-clone scratch space. Clone
//! directories are created lazily and released when the clone completes,
//! whether it ends normally, crashes, or is cancelled: the handler is owned
//! by the clone task and cleans up on drop.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tempfile::TempDir;

use crate::utilities::errors::TemporaryError;

/// Default base when the configuration names none.
pub const TEMPORARY_DEFAULT: &str = "/tmp/d20";

fn io_err(path: &Path, source: std::io::Error) -> TemporaryError {
    TemporaryError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Engine-level handler for the temporary base directory.
#[derive(Debug)]
pub struct TemporaryHandler {
    base: PathBuf,
    objects_path: PathBuf,
    players_path: PathBuf,
    base_existed: bool,
}

impl TemporaryHandler {
    pub fn new(base: impl Into<PathBuf>) -> Result<Self, TemporaryError> {
        let base = base.into();
        let base_existed = base.exists();
        if base_existed {
            if !base.is_dir() {
                return Err(TemporaryError::NotADirectory {
                    path: base.display().to_string(),
                });
            }
            log::warn!("temporary directory {} already exists", base.display());
        } else {
            std::fs::create_dir_all(&base).map_err(|e| io_err(&base, e))?;
        }

        let objects_path = base.join("objects");
        let players_path = base.join("players");
        std::fs::create_dir_all(&objects_path).map_err(|e| io_err(&objects_path, e))?;
        std::fs::create_dir_all(&players_path).map_err(|e| io_err(&players_path, e))?;

        Ok(Self {
            base,
            objects_path,
            players_path,
            base_existed,
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn objects_path(&self) -> &Path {
        &self.objects_path
    }

    /// Scratch space handler for one clone.
    pub fn clone_handler(
        &self,
        template: &str,
        serial: u64,
    ) -> Result<CloneDirectoryHandler, TemporaryError> {
        let base = self.players_path.join(format!("{template}-{serial}"));
        std::fs::create_dir_all(&base).map_err(|e| io_err(&base, e))?;
        Ok(CloneDirectoryHandler {
            base,
            my_dir: Mutex::new(None),
            temp_dirs: Mutex::new(Vec::new()),
        })
    }

    /// Remove the run's temporary tree. The base itself survives if it
    /// pre-existed this run.
    pub fn cleanup(&self) -> Result<(), TemporaryError> {
        for path in [&self.objects_path, &self.players_path] {
            if path.is_dir() {
                std::fs::remove_dir_all(path).map_err(|e| io_err(path, e))?;
            }
        }
        if !self.base_existed && self.base.is_dir() {
            std::fs::remove_dir_all(&self.base).map_err(|e| io_err(&self.base, e))?;
        }
        Ok(())
    }
}

/// Per-clone scratch directories, released when the clone completes.
#[derive(Debug)]
pub struct CloneDirectoryHandler {
    base: PathBuf,
    my_dir: Mutex<Option<PathBuf>>,
    temp_dirs: Mutex<Vec<TempDir>>,
}

impl CloneDirectoryHandler {
    /// The clone's directory, created on first use.
    pub fn my_dir(&self) -> Result<PathBuf, TemporaryError> {
        let mut slot = self.my_dir.lock().unwrap();
        if let Some(path) = slot.as_ref() {
            return Ok(path.clone());
        }
        let path = self.base.join("tmp");
        std::fs::create_dir_all(&path).map_err(|e| io_err(&path, e))?;
        *slot = Some(path.clone());
        Ok(path)
    }

    /// A fresh temporary directory with the clone's lifecycle.
    pub fn temp_dir(&self) -> Result<PathBuf, TemporaryError> {
        let dir = tempfile::Builder::new()
            .prefix("work-")
            .tempdir_in(&self.base)
            .map_err(|e| io_err(&self.base, e))?;
        let path = dir.path().to_path_buf();
        self.temp_dirs.lock().unwrap().push(dir);
        Ok(path)
    }

    /// Release everything this clone acquired.
    pub fn release(&self) {
        self.temp_dirs.lock().unwrap().clear();
        let mut slot = self.my_dir.lock().unwrap();
        if let Some(path) = slot.take() {
            if let Err(e) = std::fs::remove_dir_all(&path) {
                log::warn!("unable to remove clone directory {}: {e}", path.display());
            }
        }
        if let Err(e) = std::fs::remove_dir_all(&self.base) {
            log::debug!("clone base {} not removed: {e}", self.base.display());
        }
    }
}

impl Drop for CloneDirectoryHandler {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_base() -> PathBuf {
        tempfile::tempdir().unwrap().keep()
    }

    #[test]
    fn creates_and_cleans_the_tree() {
        let base = scratch_base().join("run");
        let handler = TemporaryHandler::new(&base).unwrap();
        assert!(base.join("objects").is_dir());
        assert!(base.join("players").is_dir());
        handler.cleanup().unwrap();
        assert!(!base.exists());
    }

    #[test]
    fn preexisting_base_survives_cleanup() {
        let base = scratch_base();
        let handler = TemporaryHandler::new(&base).unwrap();
        handler.cleanup().unwrap();
        assert!(base.exists());
        assert!(!base.join("objects").exists());
    }

    #[test]
    fn rejects_a_file_as_base() {
        let dir = scratch_base();
        let file = dir.join("occupied");
        std::fs::write(&file, b"x").unwrap();
        assert!(matches!(
            TemporaryHandler::new(&file).unwrap_err(),
            TemporaryError::NotADirectory { .. }
        ));
    }

    #[test]
    fn clone_dirs_are_lazy_and_released_on_drop() {
        let base = scratch_base().join("run");
        let handler = TemporaryHandler::new(&base).unwrap();
        let clone_dirs = handler.clone_handler("HashPlayer", 3).unwrap();

        let my_dir = clone_dirs.my_dir().unwrap();
        assert!(my_dir.is_dir());
        // Second call returns the same path.
        assert_eq!(clone_dirs.my_dir().unwrap(), my_dir);

        let work_a = clone_dirs.temp_dir().unwrap();
        let work_b = clone_dirs.temp_dir().unwrap();
        assert_ne!(work_a, work_b);
        assert!(work_a.is_dir());

        drop(clone_dirs);
        assert!(!my_dir.exists());
        assert!(!work_a.exists());
        assert!(!work_b.exists());
    }
}
