//! Guard against two sweeps sharing a results directory.

use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use fs2::FileExt;

/// Held for the duration of a sweep. Released on drop.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Take the lock at `path`, recording our PID in it.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self, LockError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| LockError::Io(parent.to_path_buf(), e))?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| LockError::Io(path.clone(), e))?;

        if let Err(e) = FileExt::try_lock_exclusive(&file) {
            if e.kind() == fs2::lock_contended_error().kind() {
                let mut content = String::new();
                let _ = file.read_to_string(&mut content);
                return Err(LockError::AlreadyRunning {
                    path,
                    pid: content.trim().parse().ok(),
                });
            }
            return Err(LockError::Io(path, e));
        }

        let write_pid = |file: &mut File| -> std::io::Result<()> {
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            writeln!(file, "{}", std::process::id())
        };
        write_pid(&mut file).map_err(|e| LockError::Io(path.clone(), e))?;

        Ok(Self { file, path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a sweep currently holds the lock at `path`, without taking it.
    pub fn inspect(path: impl AsRef<Path>) -> Result<LockState, LockError> {
        let path = path.as_ref();
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LockState::Free),
            Err(e) => return Err(LockError::Io(path.to_path_buf(), e)),
        };
        match FileExt::try_lock_shared(&file) {
            Ok(()) => {
                let _ = FileExt::unlock(&file);
                Ok(LockState::Free)
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                let mut content = String::new();
                let _ = file.read_to_string(&mut content);
                Ok(LockState::Held {
                    pid: content.trim().parse().ok(),
                })
            }
            Err(e) => Err(LockError::Io(path.to_path_buf(), e)),
        }
    }
}

/// Observed state of a sweep lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Free,
    Held { pid: Option<u32> },
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = FileExt::unlock(&self.file);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error(
        "another sweep is already running ({path}, pid {}); pass --force to run anyway",
        .pid.map_or_else(|| "unknown".to_string(), |p| p.to_string())
    )]
    AlreadyRunning { path: PathBuf, pid: Option<u32> },
    #[error("I/O error on {0}: {1}")]
    Io(PathBuf, std::io::Error),
}
