use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::vault::chunks::DateRange;
use crate::vault::store::KeyChanges;

const PREVIEW_LIMIT: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkWindow {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CategoryUploads {
    pub files_added: usize,
    pub parts: Vec<String>,
    pub bytes_uploaded: u64,
}

/// Everything one chunk changed, keyed year → category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkSummary {
    pub chunk: ChunkWindow,
    pub generated_at: String,
    pub years: BTreeMap<String, BTreeMap<String, CategoryUploads>>,
    pub files: BTreeMap<String, BTreeMap<String, Vec<String>>>,
}

impl ChunkSummary {
    pub fn build(chunk: &DateRange, changes: &[KeyChanges]) -> Self {
        let mut years: BTreeMap<String, BTreeMap<String, CategoryUploads>> = BTreeMap::new();
        let mut files: BTreeMap<String, BTreeMap<String, Vec<String>>> = BTreeMap::new();
        for change in changes {
            let year = change.year.to_string();
            let uploads = years
                .entry(year.clone())
                .or_default()
                .entry(change.category.clone())
                .or_default();
            uploads.files_added += change.new_files.len();
            for part in &change.uploaded_parts {
                uploads.parts.push(part.name.clone());
                uploads.bytes_uploaded += part.size_bytes;
            }
            if !change.new_files.is_empty() {
                files
                    .entry(year)
                    .or_default()
                    .entry(change.category.clone())
                    .or_default()
                    .extend(change.new_files.iter().cloned());
            }
        }
        Self {
            chunk: ChunkWindow {
                start: chunk.start.to_string(),
                end: chunk.end.to_string(),
            },
            generated_at: chrono::Utc::now().to_rfc3339(),
            years,
            files,
        }
    }

    pub fn files_added(&self) -> usize {
        self.files
            .values()
            .flat_map(|cats| cats.values())
            .map(Vec::len)
            .sum()
    }

    pub fn log(&self) {
        if self.files.is_empty() {
            info!("no new files for chunk {} .. {}", self.chunk.start, self.chunk.end);
            return;
        }
        info!(
            "changes for chunk {} .. {}: {} file(s)",
            self.chunk.start,
            self.chunk.end,
            self.files_added()
        );
        for (year, cats) in &self.files {
            for (category, names) in cats {
                info!("  {year}/{category}: {} file(s)", names.len());
                for name in names.iter().take(PREVIEW_LIMIT) {
                    info!("    - {name}");
                }
                if names.len() > PREVIEW_LIMIT {
                    info!("    ... plus {} more", names.len() - PREVIEW_LIMIT);
                }
            }
        }
    }
}

/// Writes the per-chunk summary (overwritten) and the cumulative history.
#[derive(Debug, Clone)]
pub struct ChangeSummaryWriter {
    dir: PathBuf,
    chunk_file: &'static str,
    history_file: &'static str,
}

impl ChangeSummaryWriter {
    /// Backfill campaigns.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            chunk_file: "chunk_changes_summary.json",
            history_file: "all_fill_changes.json",
        }
    }

    /// Incremental syncs keep a history of their own.
    pub fn for_sync(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            chunk_file: "sync_changes_summary.json",
            history_file: "all_sync_changes.json",
        }
    }

    pub fn chunk_path(&self) -> PathBuf {
        self.dir.join(self.chunk_file)
    }

    pub fn history_path(&self) -> PathBuf {
        self.dir.join(self.history_file)
    }

    pub fn write(&self, summary: &ChunkSummary) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        write_json(&self.chunk_path(), summary)?;

        let history_path = self.history_path();
        let mut history = read_history(&history_path);
        history.push(serde_json::to_value(summary)?);
        write_json(&history_path, &history)?;
        Ok(())
    }
}

fn read_history(path: &Path) -> Vec<serde_json::Value> {
    let Ok(raw) = fs::read_to_string(path) else {
        return Vec::new();
    };
    match serde_json::from_str(&raw) {
        Ok(history) => history,
        Err(err) => {
            warn!("starting a new change history; {} unreadable: {err}", path.display());
            Vec::new()
        }
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_string_pretty(value)?;
    fs::write(path, format!("{data}\n"))
        .with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::store::UploadedPart;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    fn chunk() -> DateRange {
        DateRange::new(
            NaiveDate::from_ymd_opt(2000, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2005, 1, 1).unwrap(),
        )
        .unwrap()
    }

    fn changes() -> Vec<KeyChanges> {
        vec![KeyChanges {
            year: 2001,
            category: "english".into(),
            new_files: vec!["a.pdf".into(), "b.pdf".into()],
            uploaded_parts: vec![UploadedPart {
                name: "english".into(),
                file_count: 2,
                size_bytes: 3072,
            }],
        }]
    }

    #[test]
    fn summary_groups_by_year_and_category() {
        let summary = ChunkSummary::build(&chunk(), &changes());
        assert_eq!(summary.files_added(), 2);
        let uploads = &summary.years["2001"]["english"];
        assert_eq!(uploads.parts, vec!["english"]);
        assert_eq!(uploads.bytes_uploaded, 3072);
        assert_eq!(summary.chunk.start, "2000-01-01");
    }

    #[test]
    fn history_accumulates_while_chunk_file_is_replaced() {
        let tmp = tempdir().unwrap();
        let writer = ChangeSummaryWriter::new(tmp.path());
        writer.write(&ChunkSummary::build(&chunk(), &changes())).unwrap();
        writer.write(&ChunkSummary::build(&chunk(), &[])).unwrap();

        let history: Vec<serde_json::Value> =
            serde_json::from_str(&fs::read_to_string(writer.history_path()).unwrap()).unwrap();
        assert_eq!(history.len(), 2);
        let latest: ChunkSummary =
            serde_json::from_str(&fs::read_to_string(writer.chunk_path()).unwrap()).unwrap();
        assert!(latest.files.is_empty());

        let sync = ChangeSummaryWriter::for_sync(tmp.path());
        sync.write(&ChunkSummary::build(&chunk(), &changes())).unwrap();
        assert!(sync.history_path().ends_with("all_sync_changes.json"));
        let history: Vec<serde_json::Value> =
            serde_json::from_str(&fs::read_to_string(writer.history_path()).unwrap()).unwrap();
        assert_eq!(history.len(), 2);
    }
}
