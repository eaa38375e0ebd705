use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use log::{error, warn};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PidFileError {
    #[error("Pidfile {} exists and ovnkube (pid {}) is still running!", .0.display(), .1)]
    AlreadyRunning(PathBuf, String),
    #[error("Pidfile {} exists but can't be read! {}", .0.display(), .1)]
    Unreadable(PathBuf, std::io::Error),
}

/// Process ID file, removed again when dropped.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Claims `path` for this process. A file left behind by a dead process
    /// is taken over.
    pub async fn create(path: &Path) -> Result<Self, PidFileError> {
        match tokio::fs::read_to_string(path).await {
            Ok(pid) => {
                let pid = pid.trim().to_owned();
                let cmdline = Path::new("/proc").join(&pid).join("cmdline");

                if !pid.is_empty() && tokio::fs::try_exists(&cmdline).await.unwrap_or(false) {
                    return Err(PidFileError::AlreadyRunning(path.to_owned(), pid));
                }

                warn!("Replacing stale pidfile {} (pid {pid})", path.display());
            }
            Err(error) if error.kind() == ErrorKind::NotFound => (),
            Err(error) => return Err(PidFileError::Unreadable(path.to_owned(), error)),
        }

        // not being able to write it isn't fatal
        if let Err(error) = tokio::fs::write(path, std::process::id().to_string()).await {
            error!("Failed to write pidfile {} ({error}), ignoring...", path.display());
        }

        Ok(Self {
            path: path.to_owned(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => (),
            Err(error) if error.kind() == ErrorKind::NotFound => (),
            Err(error) => error!("Deleting pidfile {} failed! {error}", self.path.display()),
        }
    }
}
