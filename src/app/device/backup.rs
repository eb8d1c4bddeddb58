use std::fs;
use std::path::{Path, PathBuf};

use crate::app::error::AppError;

/// Pristine filesystem snapshot used to restore a physical device.
///
/// Validated once, at construction, before any device command is issued: a
/// missing or empty subtree must never be discovered mid-teardown. The
/// directory is treated as read-only afterwards.
#[derive(Debug, Clone)]
pub struct BackupSource {
    root: PathBuf,
}

impl BackupSource {
    pub fn open(root: &Path, trace_id: &str) -> Result<Self, AppError> {
        if !root.is_dir() {
            return Err(AppError::backup_source(
                format!("Backup folder {} does not exist", root.display()),
                trace_id,
            ));
        }
        for subtree in ["sdcard", "partitions"] {
            let dir = root.join(subtree);
            if !dir_has_entries(&dir) {
                return Err(AppError::backup_source(
                    format!("Backup folder {} is missing or empty", dir.display()),
                    trace_id,
                ));
            }
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Files and folders restored onto device external storage.
    pub fn sdcard_dir(&self) -> PathBuf {
        self.root.join("sdcard")
    }

    /// Payload restored through the recovery flash.
    pub fn partitions_dir(&self) -> PathBuf {
        self.root.join("partitions")
    }
}

fn dir_has_entries(dir: &Path) -> bool {
    match fs::read_dir(dir) {
        Ok(mut entries) => entries.next().is_some(),
        Err(_) => false,
    }
}
