/// World snapshots on disk
///
/// Every save writes a new timestamped file into the backup directory and then
/// repoints the fixed "current" file at it. Loading reads only the current
/// file. The timestamped backups are the durable record; the current file is a
/// convenience that may lag if repointing fails.

use crate::core::entities::WorldDatabase;
use crate::error::{MushError, Result};
use chrono::Utc;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Backup files are `world-<timestamp>[-n].json`
const BACKUP_PREFIX: &str = "world-";
const BACKUP_EXTENSION: &str = "json";
const MAX_SUFFIX: u32 = 1000;

/// Save and restore a `WorldDatabase`
///
/// Only the world store calls these, from inside its serialized loop.
#[cfg_attr(test, mockall::automock)]
pub trait Snapshotter: Send + 'static {
    /// Persist `db`, returning the path of the new backup file
    fn save(&self, db: &WorldDatabase) -> Result<PathBuf>;

    /// Read the current snapshot; a missing file yields a seeded world
    fn load(&self) -> Result<WorldDatabase>;
}

/// File-system snapshot store
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    current_path: PathBuf,
    backup_dir: PathBuf,
}

impl SnapshotStore {
    /// Create a store rooted at `data_dir`
    ///
    /// `backup_dir` is resolved relative to `data_dir` unless absolute.
    pub fn new(
        data_dir: impl AsRef<Path>,
        backup_dir: impl AsRef<Path>,
        current_file: impl AsRef<Path>,
    ) -> Self {
        let data_dir = data_dir.as_ref();
        Self {
            current_path: data_dir.join(current_file),
            backup_dir: data_dir.join(backup_dir),
        }
    }

    pub fn current_path(&self) -> &Path {
        &self.current_path
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// All backup files, oldest first
    pub fn backups(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.backup_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&self.backup_dir, e)),
        };

        let mut backups = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| io_error(&self.backup_dir, e))?.path();
            let is_backup = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(BACKUP_PREFIX))
                .unwrap_or(false)
                && path.extension().and_then(|e| e.to_str()) == Some(BACKUP_EXTENSION);
            if is_backup {
                backups.push(path);
            }
        }

        // Timestamps sort lexically; the numeric suffix breaks ties
        backups.sort_by_key(|p| backup_sort_key(p));
        Ok(backups)
    }

    /// Create the next backup file, never clobbering an existing one
    fn create_backup_file(&self) -> Result<(PathBuf, File)> {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.6fZ").to_string();

        for n in 0..MAX_SUFFIX {
            let name = if n == 0 {
                format!("{}{}.{}", BACKUP_PREFIX, stamp, BACKUP_EXTENSION)
            } else {
                format!("{}{}-{}.{}", BACKUP_PREFIX, stamp, n, BACKUP_EXTENSION)
            };
            let path = self.backup_dir.join(name);

            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    debug!("Backup {} already exists, trying next suffix", path.display());
                }
                Err(e) => return Err(io_error(&path, e)),
            }
        }

        let path = self.backup_dir.join(format!("{}{}", BACKUP_PREFIX, stamp));
        Err(io_error(
            &path,
            std::io::Error::new(ErrorKind::AlreadyExists, "too many backups in one instant"),
        ))
    }

    /// Point the current file at `backup`; failures only warn
    fn repoint_current(&self, backup: &Path) {
        let staging = self.current_path.with_extension("tmp");

        if let Err(e) = fs::remove_file(&staging) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Could not remove stale {}: {}", staging.display(), e);
            }
        }

        if let Err(e) = fs::hard_link(backup, &staging) {
            warn!(
                "Could not link {} to {}: {}; falling back to copy",
                backup.display(),
                staging.display(),
                e
            );
            if let Err(e) = fs::copy(backup, &staging) {
                warn!("Could not copy {} to {}: {}", backup.display(), staging.display(), e);
                return;
            }
        }

        if let Err(e) = fs::rename(&staging, &self.current_path) {
            warn!(
                "Could not replace {} with {}: {}",
                self.current_path.display(),
                backup.display(),
                e
            );
        }
    }
}

impl Snapshotter for SnapshotStore {
    fn save(&self, db: &WorldDatabase) -> Result<PathBuf> {
        info!("Saving world state");

        fs::create_dir_all(&self.backup_dir).map_err(|e| io_error(&self.backup_dir, e))?;

        let encoded = serde_json::to_vec_pretty(db).map_err(MushError::SnapshotEncode)?;
        let (path, mut file) = self.create_backup_file()?;

        let written = file.write_all(&encoded).and_then(|()| file.sync_all());
        drop(file);
        discard_if_failed(&path, written)?;

        self.repoint_current(&path);

        info!("World state saved to {}", path.display());
        Ok(path)
    }

    fn load(&self) -> Result<WorldDatabase> {
        let bytes = match fs::read(&self.current_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(
                    "No previous world state at {}; starting a fresh world",
                    self.current_path.display()
                );
                return Ok(WorldDatabase::seeded());
            }
            Err(e) => return Err(io_error(&self.current_path, e)),
        };

        let db: WorldDatabase =
            serde_json::from_slice(&bytes).map_err(|source| MushError::SnapshotDecode {
                path: self.current_path.clone(),
                source,
            })?;

        info!(
            "World state loaded: {} rooms, {} players, {} items",
            db.rooms.len(),
            db.players.len(),
            db.items.len()
        );
        Ok(db)
    }
}

fn io_error(path: &Path, source: std::io::Error) -> MushError {
    MushError::SnapshotIo {
        path: path.to_path_buf(),
        source,
    }
}

/// Remove a backup whose write failed so it is never listed as valid
fn discard_if_failed(path: &Path, written: std::io::Result<()>) -> Result<()> {
    if let Err(e) = written {
        warn!("Discarding incomplete backup {}", path.display());
        if let Err(rm) = fs::remove_file(path) {
            warn!("Could not remove {}: {}", path.display(), rm);
        }
        return Err(io_error(path, e));
    }
    Ok(())
}

/// `world-<stamp>[-n].json` -> (stamp, n)
fn backup_sort_key(path: &Path) -> (String, u32) {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .trim_start_matches(BACKUP_PREFIX);

    match stem.rsplit_once('-') {
        Some((stamp, n)) => match n.parse() {
            Ok(n) => (stamp.to_string(), n),
            Err(_) => (stem.to_string(), 0),
        },
        None => (stem.to_string(), 0),
    }
}
