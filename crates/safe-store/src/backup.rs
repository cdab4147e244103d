//! Compressed backups of the JSON documents in a directory.
//!
//! Each run writes `backups/backup-YYYYMMDDHHMMSS.tgz` next to the documents
//! and keeps only the newest [`MAX_ARCHIVES`] archives.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use flate2::write::GzEncoder;
use flate2::Compression;
use tar::Builder;
use tracing::{error, info};

use crate::error::{Result, StoreError};

/// Number of archives kept after pruning.
pub const MAX_ARCHIVES: usize = 10;

pub const BACKUP_DIR: &str = "backups";

/// Archive every `*.json` file directly inside `source_dir`.
///
/// Returns `None` when there is nothing to back up.
pub fn create_archive(source_dir: &Path) -> Result<Option<PathBuf>> {
    let json_files = json_files(source_dir)?;
    if json_files.is_empty() {
        info!("No JSON files to back up in {}", source_dir.display());
        return Ok(None);
    }

    let backup_dir = source_dir.join(BACKUP_DIR);
    fs::create_dir_all(&backup_dir).map_err(|e| StoreError::io(&backup_dir, e))?;

    let (archive_path, file) = create_archive_file(&backup_dir)?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = Builder::new(encoder);

    for name in &json_files {
        builder
            .append_path_with_name(source_dir.join(name), name)
            .map_err(|e| StoreError::Backup(format!("append '{}': {}", name, e)))?;
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| StoreError::Backup(format!("tar finish: {}", e)))?;
    let mut out = encoder
        .finish()
        .map_err(|e| StoreError::Backup(format!("gzip finish: {}", e)))?;
    out.flush().map_err(|e| StoreError::io(&archive_path, e))?;

    info!("Backup {} created", archive_path.display());
    prune_archives(&backup_dir, MAX_ARCHIVES)?;
    Ok(Some(archive_path))
}

/// Create `backup-YYYYMMDDHHMMSS.tgz`, or `backup-YYYYMMDDHHMMSS-N.tgz` when
/// an archive from the same second already exists.
fn create_archive_file(backup_dir: &Path) -> Result<(PathBuf, File)> {
    let timestamp = chrono::Local::now().format("%Y%m%d%H%M%S").to_string();
    let mut attempt = 0u32;
    loop {
        let name = match attempt {
            0 => format!("backup-{}.tgz", timestamp),
            n => format!("backup-{}-{}.tgz", timestamp, n),
        };
        let path = backup_dir.join(name);
        match File::create_new(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => attempt += 1,
            Err(e) => return Err(StoreError::io(&path, e)),
        }
    }
}

/// Delete the oldest `.tgz` archives (by modification time) beyond `keep`.
///
/// Returns the removed paths.
pub fn prune_archives(backup_dir: &Path, keep: usize) -> Result<Vec<PathBuf>> {
    let mut archives: Vec<(SystemTime, PathBuf)> = Vec::new();
    let entries = fs::read_dir(backup_dir).map_err(|e| StoreError::io(backup_dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io(backup_dir, e))?;
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "tgz") {
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            archives.push((modified, path));
        }
    }

    if archives.len() <= keep {
        return Ok(Vec::new());
    }

    archives.sort();
    let excess = archives.len() - keep;
    let mut removed = Vec::with_capacity(excess);
    for (_, path) in archives.into_iter().take(excess) {
        match fs::remove_file(&path) {
            Ok(()) => {
                info!("Removed old backup {}", path.display());
                removed.push(path);
            }
            Err(e) => error!("Failed to remove old backup {}: {}", path.display(), e),
        }
    }
    Ok(removed)
}

/// Run [`create_archive`] on a blocking thread, logging instead of failing.
pub async fn spawn_archive(source_dir: PathBuf) -> Option<PathBuf> {
    let dir = source_dir.clone();
    match tokio::task::spawn_blocking(move || create_archive(&dir)).await {
        Ok(Ok(path)) => path,
        Ok(Err(e)) => {
            error!("Backup of {} failed: {}", source_dir.display(), e);
            None
        }
        Err(e) => {
            error!("Backup task for {} failed: {}", source_dir.display(), e);
            None
        }
    }
}

fn json_files(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| StoreError::io(dir, e))? {
        let entry = entry.map_err(|e| StoreError::io(dir, e))?;
        let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_file && name.ends_with(".json") {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}
