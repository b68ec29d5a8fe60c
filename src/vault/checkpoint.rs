use anyhow::{Context, Result};
use chrono::NaiveDate;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::VaultError;
use crate::vault::chunks::DateRange;

/// Durable progress of one backfill campaign over `[overall_start, overall_end)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkCheckpoint {
    pub overall_start: NaiveDate,
    pub overall_end: NaiveDate,
    #[serde(default)]
    pub completed_chunks: Vec<DateRange>,
    #[serde(default)]
    pub current_chunk: Option<DateRange>,
    #[serde(default)]
    pub completed_years_in_current_chunk: BTreeSet<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_chunk_end: Option<NaiveDate>,
    /// Days whose fetch failed in an earlier run; retried before new chunks.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub failed_days: BTreeSet<NaiveDate>,
    #[serde(default)]
    pub last_updated: String,
}

/// Progress file of the older fill tool. Its campaign and chunk ends are
/// inclusive; ours are exclusive.
#[derive(Debug, Deserialize)]
struct LegacyFillProgress {
    start_date: NaiveDate,
    end_date: NaiveDate,
    #[serde(default)]
    completed_chunks: Vec<(NaiveDate, NaiveDate)>,
    #[serde(default)]
    current_chunk: Option<(NaiveDate, NaiveDate)>,
    #[serde(default)]
    completed_years_in_current_chunk: BTreeSet<i32>,
    #[serde(default)]
    last_chunk_end: Option<NaiveDate>,
    #[serde(default)]
    last_updated: String,
}

fn day_after(date: NaiveDate) -> Result<NaiveDate> {
    date.succ_opt()
        .ok_or_else(|| VaultError::InvalidCheckpoint(format!("date {date} out of range")).into())
}

fn inclusive_range((start, last): (NaiveDate, NaiveDate)) -> Result<DateRange> {
    DateRange::new(start, day_after(last)?)
        .map_err(|err| VaultError::InvalidCheckpoint(err.to_string()).into())
}

impl LegacyFillProgress {
    fn into_checkpoint(self) -> Result<ChunkCheckpoint> {
        Ok(ChunkCheckpoint {
            overall_start: self.start_date,
            overall_end: day_after(self.end_date)?,
            completed_chunks: self
                .completed_chunks
                .into_iter()
                .map(inclusive_range)
                .collect::<Result<_>>()?,
            current_chunk: self.current_chunk.map(inclusive_range).transpose()?,
            completed_years_in_current_chunk: self.completed_years_in_current_chunk,
            last_chunk_end: self.last_chunk_end.map(day_after).transpose()?,
            failed_days: BTreeSet::new(),
            last_updated: self.last_updated,
        })
    }
}

impl ChunkCheckpoint {
    pub fn new(overall: DateRange) -> Self {
        Self {
            overall_start: overall.start,
            overall_end: overall.end,
            completed_chunks: Vec::new(),
            current_chunk: None,
            completed_years_in_current_chunk: BTreeSet::new(),
            last_chunk_end: None,
            failed_days: BTreeSet::new(),
            last_updated: String::new(),
        }
    }

    pub fn overall(&self) -> Result<DateRange> {
        DateRange::new(self.overall_start, self.overall_end)
            .map_err(|err| VaultError::InvalidCheckpoint(err.to_string()).into())
    }

    pub fn is_chunk_completed(&self, chunk: &DateRange) -> bool {
        self.completed_chunks.contains(chunk)
    }

    /// Enter `chunk`. Year progress carries over only when resuming the same
    /// chunk.
    pub fn begin_chunk(&mut self, chunk: DateRange) {
        if self.current_chunk != Some(chunk) {
            self.current_chunk = Some(chunk);
            self.completed_years_in_current_chunk.clear();
        }
    }

    pub fn mark_year_completed(&mut self, year: i32) {
        self.completed_years_in_current_chunk.insert(year);
    }

    pub fn complete_chunk(&mut self, chunk: DateRange) {
        if !self.completed_chunks.contains(&chunk) {
            self.completed_chunks.push(chunk);
        }
        self.current_chunk = None;
        self.completed_years_in_current_chunk.clear();
        self.last_chunk_end = Some(chunk.end);
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointFile {
    path: PathBuf,
}

impl CheckpointFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `Ok(None)` when no campaign is in progress.
    pub fn load(&self) -> Result<Option<ChunkCheckpoint>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let corrupt =
            |err: serde_json::Error| VaultError::InvalidCheckpoint(format!("{}: {err}", self.path.display()));
        let value: serde_json::Value = serde_json::from_str(&raw).map_err(corrupt)?;
        let legacy = value.get("overall_start").is_none() && value.get("start_date").is_some();
        let parsed = if legacy {
            let progress: LegacyFillProgress = serde_json::from_value(value).map_err(corrupt)?;
            info!(
                "converting legacy fill progress in {} (inclusive chunk ends)",
                self.path.display()
            );
            progress.into_checkpoint()?
        } else {
            serde_json::from_value::<ChunkCheckpoint>(value).map_err(corrupt)?
        };
        parsed.overall()?;
        Ok(Some(parsed))
    }

    /// Atomically replace the checkpoint. Within one campaign the completed
    /// chunk list may only grow at the end.
    pub fn save(&self, checkpoint: &mut ChunkCheckpoint) -> Result<()> {
        if let Some(existing) = self.load()? {
            let same_campaign = existing.overall_start == checkpoint.overall_start
                && existing.overall_end == checkpoint.overall_end;
            if same_campaign
                && !checkpoint
                    .completed_chunks
                    .starts_with(&existing.completed_chunks)
            {
                return Err(VaultError::InvalidCheckpoint(format!(
                    "refusing to drop completed chunks from {}",
                    self.path.display()
                ))
                .into());
            }
        }

        checkpoint.last_updated = chrono::Utc::now().to_rfc3339();
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
        let data = serde_json::to_string_pretty(checkpoint)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("failed to stage {}", self.path.display()))?;
        tmp.write_all(format!("{data}\n").as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|err| err.error)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }

    /// Remove the checkpoint; returns whether one existed.
    pub fn clear(&self) -> Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => {
                Err(err).with_context(|| format!("failed to remove {}", self.path.display()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::chunks::plan_chunks;
    use tempfile::tempdir;

    fn d(y: i32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, 1, 1).unwrap()
    }

    fn range(a: i32, b: i32) -> DateRange {
        DateRange::new(d(a), d(b)).unwrap()
    }

    #[test]
    fn absent_file_means_no_campaign() {
        let tmp = tempdir().unwrap();
        let file = CheckpointFile::new(tmp.path().join("cp.json"));
        assert!(file.load().unwrap().is_none());
        assert!(!file.clear().unwrap());
    }

    #[test]
    fn save_load_clear_cycle() {
        let tmp = tempdir().unwrap();
        let file = CheckpointFile::new(tmp.path().join("work/cp.json"));
        let mut cp = ChunkCheckpoint::new(range(1950, 1960));
        cp.begin_chunk(range(1950, 1955));
        cp.mark_year_completed(1950);
        file.save(&mut cp).unwrap();

        let loaded = file.load().unwrap().unwrap();
        assert_eq!(loaded.current_chunk, Some(range(1950, 1955)));
        assert!(loaded.completed_years_in_current_chunk.contains(&1950));
        assert!(!loaded.last_updated.is_empty());

        assert!(file.clear().unwrap());
        assert!(file.load().unwrap().is_none());
    }

    #[test]
    fn completed_chunks_only_grow() {
        let tmp = tempdir().unwrap();
        let file = CheckpointFile::new(tmp.path().join("cp.json"));
        let mut cp = ChunkCheckpoint::new(range(1950, 1965));
        cp.complete_chunk(range(1950, 1955));
        file.save(&mut cp).unwrap();
        cp.complete_chunk(range(1955, 1960));
        file.save(&mut cp).unwrap();

        let mut shrunk = cp.clone();
        shrunk.completed_chunks.remove(0);
        assert!(file.save(&mut shrunk).is_err());

        let mut reordered = cp.clone();
        reordered.completed_chunks.reverse();
        assert!(file.save(&mut reordered).is_err());

        let loaded = file.load().unwrap().unwrap();
        assert_eq!(loaded.completed_chunks, vec![range(1950, 1955), range(1955, 1960)]);
        assert_eq!(loaded.last_chunk_end, Some(d(1960)));
    }

    #[test]
    fn resuming_same_chunk_keeps_year_progress() {
        let mut cp = ChunkCheckpoint::new(range(2000, 2010));
        cp.begin_chunk(range(2000, 2005));
        cp.mark_year_completed(2001);
        cp.begin_chunk(range(2000, 2005));
        assert!(cp.completed_years_in_current_chunk.contains(&2001));
        cp.begin_chunk(range(2005, 2010));
        assert!(cp.completed_years_in_current_chunk.is_empty());
    }

    #[test]
    fn legacy_fill_progress_maps_onto_planned_chunks() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("sc_fill_progress.json");
        fs::write(
            &path,
            r#"{
  "start_date": "1950-01-01",
  "end_date": "1964-12-31",
  "completed_chunks": [["1950-01-01", "1954-12-31"]],
  "last_chunk_end": "1954-12-31",
  "completed_years_in_current_chunk": [1955, 1956],
  "current_chunk": ["1955-01-01", "1959-12-31"],
  "last_updated": "2025-06-01T10:00:00.123456"
}"#,
        )
        .unwrap();
        let file = CheckpointFile::new(&path);
        let mut loaded = file.load().unwrap().unwrap();
        assert_eq!(loaded.overall().unwrap(), range(1950, 1965));
        assert_eq!(loaded.last_chunk_end, Some(d(1955)));

        let planned = plan_chunks(loaded.overall().unwrap(), 5).unwrap();
        assert_eq!(planned, vec![range(1950, 1955), range(1955, 1960), range(1960, 1965)]);
        assert!(loaded.is_chunk_completed(&planned[0]));
        assert!(!loaded.is_chunk_completed(&planned[1]));
        loaded.begin_chunk(planned[1]);
        assert_eq!(
            loaded.completed_years_in_current_chunk,
            BTreeSet::from([1955, 1956])
        );

        // saving rewrites it in the current format
        file.save(&mut loaded).unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("overall_start"));
        assert_eq!(file.load().unwrap().unwrap().completed_chunks, vec![range(1950, 1955)]);
    }

    #[test]
    fn failed_days_survive_a_save() {
        let tmp = tempdir().unwrap();
        let file = CheckpointFile::new(tmp.path().join("cp.json"));
        let mut cp = ChunkCheckpoint::new(range(2000, 2010));
        let day = NaiveDate::from_ymd_opt(2002, 3, 3).unwrap();
        cp.failed_days.insert(day);
        file.save(&mut cp).unwrap();
        assert_eq!(file.load().unwrap().unwrap().failed_days, BTreeSet::from([day]));
    }

    #[test]
    fn rejects_garbage() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("cp.json");
        fs::write(&path, "{not json").unwrap();
        let err = CheckpointFile::new(&path).load().unwrap_err();
        assert!(err.to_string().contains("checkpoint rejected"));
    }
}
