use anyhow::Result;
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct VaultPaths {
    pub vault_home: PathBuf,
    /// Local working containers, checkpoint and change summaries.
    pub work_dir: PathBuf,
    /// Root of the filesystem object store when `remote.backend = "local"`.
    pub remote_dir: PathBuf,
    /// Pre-downloaded files laid out as `<YYYY-MM-DD>/<category>/<filename>`.
    pub staging_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl VaultPaths {
    pub fn checkpoint_file(&self) -> PathBuf {
        self.work_dir.join("backfill_checkpoint.json")
    }

    pub fn sync_checkpoint_file(&self) -> PathBuf {
        self.work_dir.join("sync_checkpoint.json")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.work_dir.join("backfill.lock")
    }

    pub fn containers_dir(&self) -> PathBuf {
        self.work_dir.join("containers")
    }
}

fn required_home_dir() -> Result<PathBuf> {
    if let Some(home) = dirs::home_dir() {
        return Ok(home);
    }
    Err(anyhow::anyhow!("HOME directory could not be resolved"))
}

fn env_or_default_path(var: &str, fallback: PathBuf) -> PathBuf {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => fallback,
    }
}

pub fn resolve_paths() -> Result<VaultPaths> {
    let vault_home = match env::var("COURTVAULT_HOME") {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => required_home_dir()?.join("courtvault"),
    };

    let work_dir = env_or_default_path("COURTVAULT_WORK_DIR", vault_home.join("work"));
    let remote_dir = env_or_default_path("COURTVAULT_REMOTE_DIR", vault_home.join("remote"));
    let staging_dir = env_or_default_path("COURTVAULT_STAGING_DIR", vault_home.join("staging"));
    let logs_dir = env_or_default_path("COURTVAULT_LOGS_DIR", vault_home.join("logs"));

    Ok(VaultPaths {
        vault_home,
        work_dir,
        remote_dir,
        staging_dir,
        logs_dir,
    })
}
