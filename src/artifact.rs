//! Backup, installation, and restoration of the deployed artifact tree.
use std::{
    fs, io,
    os::unix::fs::{FileTypeExt, PermissionsExt, symlink},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Local, NaiveDateTime};
use nix::{sys::stat::Mode, unistd::mkfifo};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::{
    constants::{BACKUP_TIMESTAMP_FORMAT, DEFAULT_ENTRYPOINTS},
    error::ArtifactError,
};

/// Snapshot of a previously deployed artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backup {
    /// Directory holding the snapshot.
    pub path: PathBuf,
    /// When the snapshot was taken.
    pub created_at: DateTime<Local>,
}

/// Capability the orchestrator uses to manipulate artifacts on disk.
pub trait ArtifactStore {
    /// Snapshots `deploy_dir` under `backup_root`. `Ok(None)` when there is nothing
    /// deployed yet.
    fn backup(
        &self,
        deploy_dir: &Path,
        backup_root: &Path,
        app_name: &str,
    ) -> Result<Option<Backup>, ArtifactError>;

    /// Copies the contents of `source_dir` into `deploy_dir` and marks entry points
    /// executable.
    fn deploy(&self, source_dir: &Path, deploy_dir: &Path) -> Result<(), ArtifactError>;

    /// Replaces `deploy_dir` with the contents of `backup`.
    fn restore(
        &self,
        backup: Option<&Backup>,
        deploy_dir: &Path,
    ) -> Result<(), ArtifactError>;
}

/// Filesystem-backed artifact manager.
#[derive(Debug, Clone)]
pub struct ArtifactManager {
    entrypoints: Vec<Regex>,
}

impl Default for ArtifactManager {
    fn default() -> Self {
        Self {
            entrypoints: DEFAULT_ENTRYPOINTS
                .iter()
                .filter_map(|pattern| glob_to_regex(pattern).ok())
                .collect(),
        }
    }
}

impl ArtifactManager {
    /// Creates a manager that marks top-level files matching any of the glob
    /// `patterns` (`*` and `?` wildcards) executable after install.
    pub fn with_entrypoints<S: AsRef<str>>(patterns: &[S]) -> Result<Self, regex::Error> {
        let entrypoints = patterns
            .iter()
            .map(|pattern| glob_to_regex(pattern.as_ref()))
            .collect::<Result<_, _>>()?;
        Ok(Self { entrypoints })
    }

    fn is_entrypoint(&self, name: &str) -> bool {
        self.entrypoints.iter().any(|re| re.is_match(name))
    }

    fn mark_entrypoints(&self, deploy_dir: &Path) -> Result<usize, PathError> {
        let mut marked = 0;
        let entries = fs::read_dir(deploy_dir).map_err(PathError::at(deploy_dir))?;
        for entry in entries {
            let entry = entry.map_err(PathError::at(deploy_dir))?;
            let path = entry.path();
            let name = entry.file_name();
            if !self.is_entrypoint(&name.to_string_lossy()) {
                continue;
            }

            let metadata = fs::metadata(&path).map_err(PathError::at(&path))?;
            if !metadata.is_file() {
                continue;
            }

            let mut permissions = metadata.permissions();
            permissions.set_mode(permissions.mode() | 0o111);
            fs::set_permissions(&path, permissions).map_err(PathError::at(&path))?;
            debug!("Marked {} executable", path.display());
            marked += 1;
        }
        Ok(marked)
    }
}

impl ArtifactStore for ArtifactManager {
    fn backup(
        &self,
        deploy_dir: &Path,
        backup_root: &Path,
        app_name: &str,
    ) -> Result<Option<Backup>, ArtifactError> {
        match fs::symlink_metadata(deploy_dir) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!(
                    "No existing deployment at {} to back up",
                    deploy_dir.display()
                );
                return Ok(None);
            }
            Err(source) => {
                return Err(ArtifactError::BackupFailed {
                    path: deploy_dir.to_path_buf(),
                    source,
                });
            }
        }

        fs::create_dir_all(backup_root).map_err(|source| ArtifactError::BackupFailed {
            path: backup_root.to_path_buf(),
            source,
        })?;

        let created_at = Local::now();
        let path = reserve_backup_dir(backup_root, app_name, &created_at).map_err(
            |source| ArtifactError::BackupFailed {
                path: backup_root.to_path_buf(),
                source,
            },
        )?;

        info!("Backing up {} to {}", deploy_dir.display(), path.display());
        if let Err(err) = copy_tree(deploy_dir, &path) {
            if let Err(cleanup) = fs::remove_dir_all(&path) {
                warn!(
                    "Failed to remove partial backup {}: {cleanup}",
                    path.display()
                );
            }
            return Err(ArtifactError::BackupFailed {
                path: err.path,
                source: err.source,
            });
        }

        info!("Backup created: {}", path.display());
        Ok(Some(Backup { path, created_at }))
    }

    fn deploy(&self, source_dir: &Path, deploy_dir: &Path) -> Result<(), ArtifactError> {
        if !source_dir.is_dir() {
            return Err(ArtifactError::SourceMissing(source_dir.to_path_buf()));
        }

        info!(
            "Installing {} into {}",
            source_dir.display(),
            deploy_dir.display()
        );
        fs::create_dir_all(deploy_dir)
            .map_err(PathError::at(deploy_dir))
            .and_then(|_| ensure_outside(source_dir, deploy_dir))
            .and_then(|_| copy_tree(source_dir, deploy_dir))
            .and_then(|_| self.mark_entrypoints(deploy_dir))
            .map(|marked| debug!("{marked} entry point(s) marked executable"))
            .map_err(|err| ArtifactError::DeployWriteError {
                path: err.path,
                source: err.source,
            })?;

        info!("New version installed at {}", deploy_dir.display());
        Ok(())
    }

    fn restore(
        &self,
        backup: Option<&Backup>,
        deploy_dir: &Path,
    ) -> Result<(), ArtifactError> {
        let backup = backup.ok_or(ArtifactError::BackupUnavailable)?;
        if !backup.path.is_dir() {
            warn!("Backup {} no longer exists", backup.path.display());
            return Err(ArtifactError::BackupUnavailable);
        }

        let restore_failed = |source: io::Error| ArtifactError::RestoreFailed {
            path: deploy_dir.to_path_buf(),
            source,
        };

        let stamp = Local::now().format(BACKUP_TIMESTAMP_FORMAT).to_string();
        let staging = sibling(deploy_dir, &format!(".restore-{stamp}"))
            .map_err(restore_failed)?;
        let aside = sibling(deploy_dir, &format!(".previous-{stamp}"))
            .map_err(restore_failed)?;

        if fs::symlink_metadata(&staging).is_ok() {
            fs::remove_dir_all(&staging).map_err(restore_failed)?;
        }

        info!(
            "Staging {} at {}",
            backup.path.display(),
            staging.display()
        );
        if let Err(err) = copy_tree(&backup.path, &staging) {
            let _ = fs::remove_dir_all(&staging);
            return Err(ArtifactError::RestoreFailed {
                path: err.path,
                source: err.source,
            });
        }

        let had_live = fs::symlink_metadata(deploy_dir).is_ok();
        if had_live {
            fs::rename(deploy_dir, &aside).map_err(|source| {
                let _ = fs::remove_dir_all(&staging);
                restore_failed(source)
            })?;
        }

        if let Err(source) = fs::rename(&staging, deploy_dir) {
            if had_live && let Err(err) = fs::rename(&aside, deploy_dir) {
                warn!(
                    "Failed to put {} back after aborted restore: {err}",
                    aside.display()
                );
            }
            return Err(restore_failed(source));
        }

        if had_live && let Err(err) = fs::remove_dir_all(&aside) {
            warn!(
                "Restored deployment but failed to remove {}: {err}",
                aside.display()
            );
        }

        info!(
            "Restored {} from {}",
            deploy_dir.display(),
            backup.path.display()
        );
        Ok(())
    }
}

/// Lists backups for `app_name` under `backup_root`, newest first.
pub fn list_backups(backup_root: &Path, app_name: &str) -> io::Result<Vec<Backup>> {
    let entries = match fs::read_dir(backup_root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };

    let prefix = format!("{app_name}_");
    let mut backups: Vec<(u32, Backup)> = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            let rest = name.strip_prefix(&prefix)?;
            let stamp = rest.get(..15)?;
            // Same-second backups carry a `_n` collision suffix.
            let suffix = match rest.get(15..)? {
                "" => 0,
                tail => tail.strip_prefix('_')?.parse().ok()?,
            };
            let created_at = NaiveDateTime::parse_from_str(stamp, BACKUP_TIMESTAMP_FORMAT)
                .ok()?
                .and_local_timezone(Local)
                .earliest()?;
            Some((
                suffix,
                Backup {
                    path: entry.path(),
                    created_at,
                },
            ))
        })
        .collect();

    backups.sort_by(|(a_suffix, a), (b_suffix, b)| {
        (b.created_at, *b_suffix).cmp(&(a.created_at, *a_suffix))
    });
    Ok(backups.into_iter().map(|(_, backup)| backup).collect())
}

/// Creates a fresh `<app>_<timestamp>[_n]` directory, probing suffixes until one is free.
fn reserve_backup_dir(
    backup_root: &Path,
    app_name: &str,
    created_at: &DateTime<Local>,
) -> io::Result<PathBuf> {
    let base = format!("{app_name}_{}", created_at.format(BACKUP_TIMESTAMP_FORMAT));
    let mut suffix = 0u32;
    loop {
        let name = if suffix == 0 {
            base.clone()
        } else {
            format!("{base}_{suffix}")
        };
        let candidate = backup_root.join(name);
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => suffix += 1,
            Err(err) => return Err(err),
        }
    }
}

fn sibling(path: &Path, suffix: &str) -> io::Result<PathBuf> {
    let name = path.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} has no final path component", path.display()),
        )
    })?;
    let mut name = name.to_os_string();
    name.push(suffix);
    Ok(path.with_file_name(name))
}

fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let escaped = regex::escape(pattern)
        .replace(r"\*", ".*")
        .replace(r"\?", ".");
    Regex::new(&format!("^{escaped}$"))
}

/// I/O failure annotated with the path it happened on.
#[derive(Debug)]
struct PathError {
    path: PathBuf,
    source: io::Error,
}

impl PathError {
    fn at(path: &Path) -> impl FnOnce(io::Error) -> PathError + '_ {
        move |source| PathError {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Rejects a `dst` that resolves to `src` or lies inside it. Copying a tree onto
/// itself truncates every file, and copying into a subdirectory never terminates.
fn ensure_outside(src: &Path, dst: &Path) -> Result<(), PathError> {
    let src = fs::canonicalize(src).map_err(PathError::at(src))?;
    let resolved = fs::canonicalize(dst).map_err(PathError::at(dst))?;
    if resolved.starts_with(&src) {
        return Err(PathError {
            path: dst.to_path_buf(),
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("target lies inside source {}", src.display()),
            ),
        });
    }
    Ok(())
}

/// Recursively copies `src` into `dst`, merging with anything already there.
/// File contents, permission bits, symlinks and FIFOs are preserved. Sockets and
/// device nodes are skipped.
fn copy_tree(src: &Path, dst: &Path) -> Result<(), PathError> {
    let src_meta = fs::metadata(src).map_err(PathError::at(src))?;
    fs::create_dir_all(dst).map_err(PathError::at(dst))?;

    let entries = fs::read_dir(src).map_err(PathError::at(src))?;
    for entry in entries {
        let entry = entry.map_err(PathError::at(src))?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry.file_type().map_err(PathError::at(&from))?;

        if file_type.is_symlink() {
            let target = fs::read_link(&from).map_err(PathError::at(&from))?;
            if fs::symlink_metadata(&to).is_ok() {
                remove_entry(&to).map_err(PathError::at(&to))?;
            }
            symlink(&target, &to).map_err(PathError::at(&to))?;
        } else if file_type.is_dir() {
            if let Ok(existing) = fs::symlink_metadata(&to)
                && !existing.is_dir()
            {
                remove_entry(&to).map_err(PathError::at(&to))?;
            }
            copy_tree(&from, &to)?;
        } else if file_type.is_fifo() {
            if fs::symlink_metadata(&to).is_ok() {
                remove_entry(&to).map_err(PathError::at(&to))?;
            }
            let permissions = entry.metadata().map_err(PathError::at(&from))?.permissions();
            mkfifo(to.as_path(), Mode::from_bits_truncate((permissions.mode() & 0o7777) as _))
                .map_err(|errno| PathError {
                    path: to.clone(),
                    source: io::Error::from(errno),
                })?;
            fs::set_permissions(&to, permissions).map_err(PathError::at(&to))?;
        } else if file_type.is_socket() {
            debug!("Skipping socket {}", from.display());
        } else if file_type.is_block_device() || file_type.is_char_device() {
            warn!("Skipping device node {}", from.display());
        } else {
            // Anything but a regular file at the target (a FIFO especially) is replaced
            // rather than opened for writing.
            if let Ok(existing) = fs::symlink_metadata(&to)
                && !existing.is_file()
            {
                remove_entry(&to).map_err(PathError::at(&to))?;
            }
            fs::copy(&from, &to).map_err(PathError::at(&from))?;
        }
    }

    fs::set_permissions(dst, src_meta.permissions()).map_err(PathError::at(dst))?;
    Ok(())
}

fn remove_entry(path: &Path) -> io::Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}
