//! Advisory lock serialising deployments to the same location.
use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::{constants::LOCK_SUFFIX, error::DeployError};

/// Exclusive lock on `<deploy_dir>.lock`, released on drop.
#[derive(Debug)]
pub struct DeployLock {
    file: File,
    path: PathBuf,
}

impl DeployLock {
    /// Path of the lock file guarding `deploy_dir`.
    pub fn path_for(deploy_dir: &Path) -> PathBuf {
        let mut name = deploy_dir
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| "deploy".into());
        name.push(LOCK_SUFFIX);
        deploy_dir.with_file_name(name)
    }

    /// Takes the lock without blocking. Fails with `DeployLocked` when another
    /// orchestrator holds it.
    pub fn acquire(deploy_dir: &Path) -> Result<Self, DeployError> {
        let path = Self::path_for(deploy_dir);
        let unexpected = |err: io::Error| {
            DeployError::Unexpected(format!(
                "cannot open lock file {}: {err}",
                path.display()
            ))
        };

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(unexpected)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(unexpected)?;

        if file.try_lock_exclusive().is_err() {
            return Err(DeployError::DeployLocked(deploy_dir.to_path_buf()));
        }

        // Record the holder for operators inspecting a stuck lock.
        if let Err(err) = file
            .set_len(0)
            .and_then(|_| writeln!(file, "{}", std::process::id()))
        {
            warn!("Failed to record holder PID in {}: {err}", path.display());
        }

        debug!("Acquired deploy lock {}", path.display());
        Ok(Self { file, path })
    }
}

impl Drop for DeployLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!("Failed to release deploy lock {}: {err}", self.path.display());
        }
    }
}
