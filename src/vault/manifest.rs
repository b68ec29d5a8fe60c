use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

use crate::vault::key::{ArchiveKey, Category};
use crate::vault::object_store::ObjectStore;
use crate::vault::util::format_size;

/// One bounded container belonging to a key. Never changes once uploaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivePart {
    pub name: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub file_count: usize,
    #[serde(default, alias = "size", alias = "zip_size")]
    pub size_bytes: u64,
    #[serde(default, alias = "zip_size_human")]
    pub size_human: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl ArchivePart {
    pub fn new(name: &str, files: Vec<String>, size_bytes: u64, created_at: &str) -> Self {
        Self {
            name: name.to_string(),
            file_count: files.len(),
            files,
            size_bytes,
            size_human: format_size(size_bytes),
            created_at: created_at.to_string(),
            sha256: None,
        }
    }
}

/// `<category>.index.json`: everything known about one key's containers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveManifest {
    pub year: i32,
    #[serde(alias = "archive_type")]
    pub category: Category,
    #[serde(default)]
    pub file_count: usize,
    #[serde(default, alias = "total_size", alias = "zip_size")]
    pub total_size_bytes: u64,
    #[serde(default, alias = "zip_size_human")]
    pub total_size_human: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub parts: Vec<ArchivePart>,
    /// Flat file list of the pre-partitioning format. Written back only when
    /// non-empty so old readers keep working.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
}

impl ArchiveManifest {
    pub fn empty(key: &ArchiveKey, now: &str) -> Self {
        Self {
            year: key.year,
            category: key.category.clone(),
            file_count: 0,
            total_size_bytes: 0,
            total_size_human: format_size(0),
            created_at: now.to_string(),
            updated_at: now.to_string(),
            parts: Vec::new(),
            files: Vec::new(),
        }
    }

    /// Fetch the index for `key`. A missing index is a cold start, not an
    /// error; any other store failure propagates.
    pub fn load(store: &dyn ObjectStore, key: &ArchiveKey, now: &str) -> Result<Self> {
        let index_key = key.index_key();
        let Some(raw) = store
            .get(&index_key)
            .with_context(|| format!("failed to fetch {index_key}"))?
        else {
            return Ok(Self::empty(key, now));
        };
        Self::from_slice(&raw).with_context(|| format!("failed to parse {index_key}"))
    }

    pub fn from_slice(raw: &[u8]) -> Result<Self> {
        let mut manifest: ArchiveManifest = serde_json::from_slice(raw)?;
        if manifest.file_count == 0 && manifest.parts.is_empty() {
            manifest.file_count = manifest.files.len();
        }
        if manifest.total_size_human.is_empty() {
            manifest.total_size_human = format_size(manifest.total_size_bytes);
        }
        Ok(manifest)
    }

    pub fn save(&self, store: &dyn ObjectStore, key: &ArchiveKey) -> Result<()> {
        let index_key = key.index_key();
        let data = serde_json::to_vec_pretty(self)?;
        store
            .put(&index_key, &data)
            .with_context(|| format!("failed to upload {index_key}"))?;
        Ok(())
    }

    /// Merge a finalized part. A part with the same name (a resumed container
    /// that grew) replaces the earlier record. Totals are recomputed from the
    /// parts so they can never drift.
    pub fn add_part(&mut self, part: ArchivePart, now: &str) {
        match self.parts.iter_mut().find(|p| p.name == part.name) {
            Some(existing) => *existing = part,
            None => self.parts.push(part),
        }
        self.recompute_totals();
        self.updated_at = now.to_string();
    }

    fn recompute_totals(&mut self) {
        self.file_count = self.parts.iter().map(|p| p.file_count).sum();
        self.total_size_bytes = self.parts.iter().map(|p| p.size_bytes).sum();
        self.total_size_human = format_size(self.total_size_bytes);
    }

    /// Union of the legacy flat list and every part's files.
    pub fn all_files(&self) -> HashSet<String> {
        self.files
            .iter()
            .chain(self.parts.iter().flat_map(|p| p.files.iter()))
            .cloned()
            .collect()
    }

    pub fn last_part(&self) -> Option<&ArchivePart> {
        self.parts.last()
    }

    /// Rewrite a flat legacy index into the parts layout: the legacy
    /// canonical container becomes the first part. `files` is kept so old
    /// readers still find them. Returns `false` when nothing needed doing.
    pub fn upgrade_legacy(&mut self, canonical_name: &str, container_size: Option<u64>, now: &str) -> bool {
        if !self.parts.is_empty() || self.files.is_empty() {
            return false;
        }
        let size = container_size.unwrap_or(self.total_size_bytes);
        let created_at = if self.created_at.is_empty() {
            now.to_string()
        } else {
            self.created_at.clone()
        };
        let part = ArchivePart::new(canonical_name, self.files.clone(), size, &created_at);
        self.add_part(part, now);
        true
    }
}

/// True when the document has no non-empty `parts` array, i.e. it predates
/// partitioned containers.
pub fn is_legacy_format(raw: &Value) -> bool {
    !raw.get("parts")
        .and_then(Value::as_array)
        .is_some_and(|parts| !parts.is_empty())
}
