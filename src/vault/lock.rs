use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::VaultError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockPayload {
    pub pid: u32,
    pub build_uuid: String,
    pub start_time: String,
}

/// Exclusive hold on a work directory's backfill. Released on drop.
#[derive(Debug)]
pub struct CampaignLock {
    file: File,
    path: PathBuf,
}

impl CampaignLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        if file.try_lock_exclusive().is_err() {
            return Err(VaultError::CampaignLocked(path.display().to_string()).into());
        }

        let payload = LockPayload {
            pid: std::process::id(),
            build_uuid: env!("BUILD_UUID").to_string(),
            start_time: chrono::Utc::now().to_rfc3339(),
        };
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(serde_json::to_string(&payload)?.as_bytes())?;
        file.flush()?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CampaignLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = FileExt::unlock(&self.file);
    }
}

/// Payload of a lock file, if one was written. Says nothing about whether
/// the holder is still alive.
pub fn read_payload(path: &Path) -> Option<LockPayload> {
    let raw = fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

/// Whether some process currently holds the lock.
pub fn is_held(path: &Path) -> bool {
    let Ok(file) = OpenOptions::new().read(true).write(true).open(path) else {
        return false;
    };
    match file.try_lock_exclusive() {
        Ok(()) => {
            let _ = FileExt::unlock(&file);
            false
        }
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn second_acquire_fails_until_released() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("work/backfill.lock");

        let first = CampaignLock::acquire(&path).unwrap();
        assert!(is_held(&path));
        assert_eq!(read_payload(&path).unwrap().pid, std::process::id());

        let err = CampaignLock::acquire(&path).unwrap_err();
        let vault = err.downcast_ref::<VaultError>().unwrap();
        assert_eq!(vault.code().as_str(), "E001_LOCKED");

        drop(first);
        assert!(!is_held(&path));
        assert!(CampaignLock::acquire(&path).is_ok());
    }
}
