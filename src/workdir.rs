//! Worker-owned directory tree and the boot-time writability probe.
//!
//! A [`WorkingDirectory`] is held exclusively by one worker instance for the
//! life of the process: exclusivity is an advisory lock on a `LOCK` file in
//! the root, so a crashed process never leaves a stale claim behind.

use fs2::FileExt;
use log::{debug, warn};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const LOCK_FILE_NAME: &str = "LOCK";
const TMP_DIR_NAME: &str = "tmp";

#[derive(Debug, Error)]
pub enum WorkingDirectoryError {
    #[error("working directory {path:?} is locked by another worker")]
    Locked { path: PathBuf },
    #[error("working directory {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl WorkingDirectoryError {
    pub fn path(&self) -> &Path {
        match self {
            WorkingDirectoryError::Locked { path } | WorkingDirectoryError::Io { path, .. } => {
                path
            }
        }
    }
}

#[derive(Debug)]
pub struct WorkingDirectory {
    root: PathBuf,
    tmp: PathBuf,
    created_root: bool,
    lock: Option<File>,
}

impl WorkingDirectory {
    /// Creates (if needed) and locks `root`, then prepares its `tmp/` area.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, WorkingDirectoryError> {
        let root = root.into();
        let created_root = !root.exists();
        fs::create_dir_all(&root).map_err(|source| WorkingDirectoryError::Io {
            path: root.clone(),
            source,
        })?;
        // Any early return below drops `dir`, which undoes what was created.
        let mut dir = WorkingDirectory {
            tmp: root.join(TMP_DIR_NAME),
            root,
            created_root,
            lock: None,
        };

        let lock_path = dir.root.join(LOCK_FILE_NAME);
        let mut lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|source| WorkingDirectoryError::Io {
                path: lock_path.clone(),
                source,
            })?;
        if let Err(err) = lock.try_lock_exclusive() {
            if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
                return Err(WorkingDirectoryError::Locked {
                    path: dir.root.clone(),
                });
            }
            return Err(WorkingDirectoryError::Io {
                path: lock_path,
                source: err,
            });
        }
        lock.set_len(0)
            .and_then(|_| writeln!(lock, "{}", std::process::id()))
            .map_err(|source| WorkingDirectoryError::Io {
                path: lock_path.clone(),
                source,
            })?;
        dir.lock = Some(lock);

        fs::create_dir_all(&dir.tmp).map_err(|source| WorkingDirectoryError::Io {
            path: dir.tmp.clone(),
            source,
        })?;
        debug!(
            "event=working_directory_locked path={} created={}",
            dir.root.display(),
            dir.created_root
        );
        Ok(dir)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp
    }

    /// Unlocks the directory. With `cleanup` the whole tree is removed,
    /// otherwise only `tmp/` is discarded and the rest is left for
    /// inspection.
    pub fn release(mut self, cleanup: bool) -> Result<(), WorkingDirectoryError> {
        let target = if cleanup { &self.root } else { &self.tmp };
        let result = match fs::remove_dir_all(target) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(WorkingDirectoryError::Io {
                path: target.clone(),
                source,
            }),
        };
        self.lock = None;
        self.created_root = false;
        result
    }
}

impl Drop for WorkingDirectory {
    fn drop(&mut self) {
        if self.lock.take().is_some() {
            if let Err(err) = fs::remove_dir_all(&self.tmp) {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!(
                        "event=working_directory_tmp_cleanup_failed path={} error={err}",
                        self.tmp.display()
                    );
                }
            }
        }
        if self.created_root {
            let _ = fs::remove_dir_all(&self.root);
        }
    }
}

#[derive(Debug, Error)]
#[error("I/O directory {path:?} is not usable: {source}")]
pub struct ProbeError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Writes and deletes a scratch file inside `path`. Nothing outside `path`
/// is touched.
pub fn probe(path: &Path) -> Result<(), ProbeError> {
    let fail = |source: io::Error| ProbeError {
        path: path.to_path_buf(),
        source,
    };
    let metadata = fs::metadata(path).map_err(fail)?;
    if !metadata.is_dir() {
        return Err(fail(io::Error::new(
            io::ErrorKind::InvalidInput,
            "not a directory",
        )));
    }
    let scratch = path.join(format!(
        ".probe-{}-{:016x}",
        std::process::id(),
        rand::random::<u64>()
    ));
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&scratch)
        .map_err(fail)?;
    let written = file.write_all(b"probe").and_then(|_| file.flush());
    drop(file);
    let removed = fs::remove_file(&scratch);
    written.map_err(fail)?;
    removed.map_err(fail)
}
