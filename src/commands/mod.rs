pub mod backfill;
pub mod export;
pub mod migrate_index;
pub mod status;
pub mod sync;
pub mod verify;

use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;

use crate::vault::config::{VaultConfig, load_config};
use crate::vault::object_store::{ObjectStore, backend_from_config};
use crate::vault::paths::{VaultPaths, resolve_paths};

#[derive(Debug, Clone, Serialize)]
pub struct CommandReport {
    pub command: String,
    pub ok: bool,
    pub details: Vec<String>,
    pub issues: Vec<String>,
}

impl CommandReport {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ok: true,
            details: Vec::new(),
            issues: Vec::new(),
        }
    }

    pub fn detail(&mut self, text: impl Into<String>) {
        self.details.push(text.into());
    }

    pub fn issue(&mut self, text: impl Into<String>) {
        self.ok = false;
        self.issues.push(text.into());
    }

    pub fn merge(&mut self, mut other: CommandReport) {
        self.ok &= other.ok;
        self.details.append(&mut other.details);
        self.issues.append(&mut other.issues);
    }
}

/// Resolved paths, validated config and the configured remote.
pub struct VaultContext {
    pub paths: VaultPaths,
    pub config: VaultConfig,
    pub remote: Arc<dyn ObjectStore>,
}

pub fn open_vault() -> Result<VaultContext> {
    let paths = resolve_paths()?;
    let config = load_config()?;
    let remote = backend_from_config(&config.remote, &paths)?;
    Ok(VaultContext {
        paths,
        config,
        remote,
    })
}
