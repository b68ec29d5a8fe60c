use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub at: String,
    pub phase: String,
    pub status: String,
    pub message: String,
}

/// Append-only JSON-lines log of campaign lifecycle events.
#[derive(Debug, Clone)]
pub struct AuditLog {
    dir: PathBuf,
}

impl AuditLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join("audit.log")
    }

    pub fn append(&self, phase: &str, status: &str, message: &str) -> Result<()> {
        append_event(&self.dir, phase, status, message)
    }

    /// Same as `append`, but a failure only logs.
    pub fn record(&self, phase: &str, status: &str, message: &str) {
        if let Err(err) = self.append(phase, status, message) {
            log::warn!("audit append failed ({phase}/{status}): {err:#}");
        }
    }
}

pub fn append_event(logs_dir: &Path, phase: &str, status: &str, message: &str) -> Result<()> {
    fs::create_dir_all(logs_dir)
        .with_context(|| format!("failed to create {}", logs_dir.display()))?;
    let event = AuditEvent {
        at: chrono::Utc::now().to_rfc3339(),
        phase: phase.to_string(),
        status: status.to_string(),
        message: message.to_string(),
    };

    let line = format!("{}\n", serde_json::to_string(&event)?);
    let path = logs_dir.join("audit.log");
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.write_all(line.as_bytes())?;
    Ok(())
}
