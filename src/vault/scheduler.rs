//! Resumable, checkpointed backfill over a fixed date range.
//!
//! The range is cut into chunks of whole years and each chunk into daily
//! tasks run on a worker pool. When results move past a year and every task
//! of that year has finished, the year is uploaded and recorded in the
//! checkpoint; that save is the recovery point.
//!
//! A failed day never holds up its chunk. It is logged, kept out of the
//! completed years, and listed in the checkpoint so a resumed run fetches it
//! again before moving on.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use log::{info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::vault::audit::AuditLog;
use crate::vault::checkpoint::{CheckpointFile, ChunkCheckpoint};
use crate::vault::chunks::{DateRange, DayTask, daily_tasks, plan_chunks};
use crate::vault::derived::DerivedOutput;
use crate::vault::fetcher::Fetcher;
use crate::vault::key::{ArchiveKey, Category};
use crate::vault::pool::WorkerPool;
use crate::vault::store::PartitionedArchiveStore;
use crate::vault::summary::{ChangeSummaryWriter, ChunkSummary};
use crate::vault::warn::{self, WarnEvent};

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub chunk_years: u32,
    pub workers: usize,
    pub timeout: Option<Duration>,
    pub categories: Vec<Category>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignState {
    NotStarted,
    Running,
    /// Time budget spent; the checkpoint holds the resume point.
    Suspended,
    Completed,
}

impl CampaignState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CampaignOutcome {
    pub state: CampaignState,
    pub overall: DateRange,
    pub resumed: bool,
    pub chunks_total: usize,
    pub chunks_completed: usize,
    pub chunks_completed_this_run: usize,
    pub chunks_remaining: usize,
    /// Years not fetched again because an earlier run finished them.
    pub skipped_years: Vec<i32>,
    pub years_uploaded: Vec<i32>,
    /// Years of the interrupted chunk still to do.
    pub open_years: Vec<i32>,
    pub tasks_run: usize,
    pub failed_tasks: usize,
    /// Days carried over from earlier runs and fetched again.
    pub retried_days: usize,
    /// Days still failing when the run ended.
    pub failed_days: Vec<NaiveDate>,
    pub files_added: usize,
}

impl CampaignOutcome {
    fn new(overall: DateRange, resumed: bool, chunks_total: usize, chunks_completed: usize) -> Self {
        Self {
            state: CampaignState::Running,
            overall,
            resumed,
            chunks_total,
            chunks_completed,
            chunks_completed_this_run: 0,
            chunks_remaining: chunks_total - chunks_completed,
            skipped_years: Vec::new(),
            years_uploaded: Vec::new(),
            open_years: Vec::new(),
            tasks_run: 0,
            failed_tasks: 0,
            retried_days: 0,
            failed_days: Vec::new(),
            files_added: 0,
        }
    }
}

#[derive(Debug, Default)]
struct TaskOutcome {
    fetched: usize,
    fresh: usize,
    added: usize,
    keys: BTreeSet<ArchiveKey>,
}

fn run_task(store: &PartitionedArchiveStore, fetcher: &dyn Fetcher, task: &DayTask) -> Result<TaskOutcome> {
    let items = fetcher.fetch(task)?;
    let mut outcome = TaskOutcome::default();
    for item in items {
        let key = ArchiveKey::new(item.year, item.category);
        outcome.fetched += 1;
        if item.content_is_new {
            outcome.fresh += 1;
        }
        if store
            .add_file(&key, &item.filename, &item.content)
            .with_context(|| format!("failed to archive {} into {key}", item.filename))?
        {
            outcome.added += 1;
        }
        outcome.keys.insert(key);
    }
    Ok(outcome)
}

enum ChunkResult {
    Completed,
    TimedOut,
}

/// Per-chunk bookkeeping on the control thread.
#[derive(Default)]
struct ChunkProgress {
    outstanding: BTreeMap<i32, usize>,
    failed_days: BTreeSet<NaiveDate>,
    failed_years: BTreeSet<i32>,
    /// Years the result cursor has moved past, waiting for stragglers.
    behind_cursor: BTreeSet<i32>,
    /// Years whose boundary upload failed; retried at chunk end.
    retry: BTreeSet<i32>,
    finished: BTreeSet<i32>,
    touched_keys: BTreeSet<ArchiveKey>,
    current_year: Option<i32>,
}

pub struct ChunkScheduler {
    store: Arc<PartitionedArchiveStore>,
    fetcher: Arc<dyn Fetcher>,
    checkpoint: CheckpointFile,
    options: SchedulerOptions,
    derived: Option<Box<dyn DerivedOutput>>,
    summaries: Option<ChangeSummaryWriter>,
    audit: Option<AuditLog>,
}

impl ChunkScheduler {
    pub fn new(
        store: Arc<PartitionedArchiveStore>,
        fetcher: Arc<dyn Fetcher>,
        checkpoint: CheckpointFile,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            store,
            fetcher,
            checkpoint,
            options,
            derived: None,
            summaries: None,
            audit: None,
        }
    }

    pub fn with_derived(mut self, derived: Box<dyn DerivedOutput>) -> Self {
        self.derived = Some(derived);
        self
    }

    pub fn with_summaries(mut self, writer: ChangeSummaryWriter) -> Self {
        self.summaries = Some(writer);
        self
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    fn audit(&self, phase: &str, status: &str, message: &str) {
        if let Some(audit) = &self.audit {
            audit.record(phase, status, message);
        }
    }

    fn timed_out(&self, started: Instant) -> bool {
        self.options
            .timeout
            .is_some_and(|budget| started.elapsed() >= budget)
    }

    /// Run or resume the campaign. An existing checkpoint decides the range;
    /// `requested` only applies to a fresh campaign.
    pub fn run(&self, requested: DateRange) -> Result<CampaignOutcome> {
        let (mut cp, resumed) = match self.checkpoint.load()? {
            Some(cp) => {
                let overall = cp.overall()?;
                if overall != requested {
                    warn!("checkpoint campaign {overall} takes precedence over requested {requested}");
                }
                (cp, true)
            }
            None => (ChunkCheckpoint::new(requested), false),
        };
        let overall = cp.overall()?;
        let chunks = plan_chunks(overall, self.options.chunk_years)?;
        let remaining: Vec<DateRange> = chunks
            .iter()
            .filter(|c| !cp.is_chunk_completed(c))
            .copied()
            .collect();
        let mut outcome =
            CampaignOutcome::new(overall, resumed, chunks.len(), chunks.len() - remaining.len());

        if remaining.is_empty() && cp.failed_days.is_empty() {
            self.checkpoint.clear()?;
            outcome.state = CampaignState::Completed;
            self.audit("campaign", "completed", &overall.to_string());
            return Ok(outcome);
        }

        if resumed {
            info!(
                "resuming campaign {overall}: {} of {} chunks done",
                outcome.chunks_completed, outcome.chunks_total
            );
            self.audit("campaign", "resumed", &overall.to_string());
        } else {
            info!("starting campaign {overall}: {} chunks", outcome.chunks_total);
            self.audit("campaign", "started", &overall.to_string());
        }

        let started = Instant::now();
        let pool = WorkerPool::new("courtvault-task", self.options.workers);
        if !cp.failed_days.is_empty() {
            if self.timed_out(started) {
                return self.suspend(&mut cp, outcome);
            }
            self.retry_failed_days(&pool, &mut cp, &mut outcome)?;
        }
        for chunk in remaining {
            if self.timed_out(started) {
                info!("time budget spent before chunk {chunk}");
                return self.suspend(&mut cp, outcome);
            }
            match self.run_chunk(&pool, chunk, &mut cp, started, &mut outcome)? {
                ChunkResult::Completed => {}
                ChunkResult::TimedOut => return self.suspend(&mut cp, outcome),
            }
        }

        self.store.close_session()?;
        outcome.failed_days = cp.failed_days.iter().copied().collect();
        self.checkpoint.clear()?;
        outcome.state = CampaignState::Completed;
        if outcome.failed_days.is_empty() {
            info!("campaign {overall} complete");
            self.audit("campaign", "completed", &overall.to_string());
        } else {
            warn!(
                "campaign {overall} complete; {} day(s) never fetched: {:?}",
                outcome.failed_days.len(),
                outcome.failed_days
            );
            self.audit(
                "campaign",
                "completed-with-failures",
                &format!("{overall}; failed days {:?}", outcome.failed_days),
            );
        }
        Ok(outcome)
    }

    /// Fetch again the days that failed in an earlier run. Days of the
    /// interrupted chunk whose year is still open are left to that chunk.
    fn retry_failed_days(
        &self,
        pool: &WorkerPool,
        cp: &mut ChunkCheckpoint,
        outcome: &mut CampaignOutcome,
    ) -> Result<()> {
        let carried = std::mem::take(&mut cp.failed_days);
        let tasks: Vec<DayTask> = carried
            .into_iter()
            .map(|date| DayTask { date })
            .filter(|task| {
                !cp.current_chunk.is_some_and(|chunk| {
                    chunk.contains(task.date)
                        && !cp.completed_years_in_current_chunk.contains(&task.year())
                })
            })
            .collect();
        if tasks.is_empty() {
            return self.checkpoint.save(cp);
        }
        let days: Vec<NaiveDate> = tasks.iter().map(|t| t.date).collect();
        info!("retrying {} day(s) that failed in an earlier run", days.len());

        let mut progress = ChunkProgress::default();
        let store = self.store.clone();
        let fetcher = self.fetcher.clone();
        let batch = pool.run(tasks, move |task: &DayTask| {
            run_task(&store, fetcher.as_ref(), task)
        });
        for (task, result) in batch {
            self.absorb(&task, result, &mut progress, outcome);
        }
        outcome.retried_days += days.len();

        let years: BTreeSet<i32> = progress.touched_keys.iter().map(|k| k.year).collect();
        for year in years {
            if let Err(err) = self.upload_year(year, &progress.touched_keys) {
                cp.failed_days.extend(days.iter().copied());
                self.checkpoint.save(cp)?;
                return Err(err.context(format!("upload of retried year {year} failed")));
            }
            if !outcome.years_uploaded.contains(&year) {
                outcome.years_uploaded.push(year);
            }
        }
        cp.failed_days.extend(progress.failed_days.iter().copied());
        self.checkpoint.save(cp)?;
        self.audit(
            "retry",
            "done",
            &format!("{} day(s), {} still failing", days.len(), progress.failed_days.len()),
        );
        Ok(())
    }

    fn suspend(&self, cp: &mut ChunkCheckpoint, mut outcome: CampaignOutcome) -> Result<CampaignOutcome> {
        self.checkpoint.save(cp)?;
        if let Err(err) = self.store.close_session() {
            warn::emit(WarnEvent {
                code: "SESSION_CLOSE_FAILED",
                stage: "scheduler",
                action: "close-session",
                key: "all",
                retry: "next-run",
                reason: "store-error",
                err: &format!("{err:#}"),
            });
        }
        if let Some(chunk) = cp.current_chunk {
            outcome.open_years = chunk
                .years()
                .into_iter()
                .filter(|y| !cp.completed_years_in_current_chunk.contains(y))
                .collect();
        }
        outcome.failed_days = cp.failed_days.iter().copied().collect();
        outcome.state = CampaignState::Suspended;
        info!(
            "campaign suspended on timeout: {} chunk(s) remaining, open years {:?}",
            outcome.chunks_remaining, outcome.open_years
        );
        self.audit(
            "campaign",
            "suspended",
            &format!("timeout; {} chunks remaining", outcome.chunks_remaining),
        );
        Ok(outcome)
    }

    fn run_chunk(
        &self,
        pool: &WorkerPool,
        chunk: DateRange,
        cp: &mut ChunkCheckpoint,
        started: Instant,
        outcome: &mut CampaignOutcome,
    ) -> Result<ChunkResult> {
        cp.begin_chunk(chunk);
        self.checkpoint.save(cp)?;

        let done: BTreeSet<i32> = cp.completed_years_in_current_chunk.clone();
        let all_tasks = daily_tasks(&chunk);
        let total = all_tasks.len();
        let tasks: Vec<DayTask> = all_tasks
            .into_iter()
            .filter(|t| !done.contains(&t.year()))
            .collect();
        if tasks.len() < total {
            info!(
                "chunk {chunk}: skipping {} tasks from completed years {:?}",
                total - tasks.len(),
                done
            );
            outcome.skipped_years.extend(done.iter().copied());
        }
        info!("chunk {chunk}: {} daily tasks", tasks.len());

        let mut progress = ChunkProgress::default();
        for task in &tasks {
            *progress.outstanding.entry(task.year()).or_default() += 1;
        }

        let store = self.store.clone();
        let fetcher = self.fetcher.clone();
        let mut batch = pool.run(tasks, move |task: &DayTask| {
            run_task(&store, fetcher.as_ref(), task)
        });
        log::debug!(
            "chunk {chunk}: {} tasks submitted to {} workers",
            batch.submitted(),
            pool.workers()
        );

        while let Some((task, result)) = batch.next() {
            self.absorb(&task, result, &mut progress, outcome);

            let year = task.year();
            if let Some(prev) = progress.current_year
                && prev != year
                && !progress.finished.contains(&prev)
            {
                info!("year {prev} -> {year}");
                progress.behind_cursor.insert(prev);
            }
            progress.current_year = Some(year);

            let ready: Vec<i32> = progress
                .behind_cursor
                .iter()
                .copied()
                .filter(|y| progress.outstanding.get(y).copied().unwrap_or(0) == 0)
                .collect();
            for y in ready {
                progress.behind_cursor.remove(&y);
                self.finish_year_at_boundary(chunk, y, cp, &mut progress, outcome)?;
            }

            if self.timed_out(started) {
                warn!(
                    "time budget spent inside chunk {chunk}; cancelling {} queued tasks",
                    batch.unstarted()
                );
                for (task, result) in batch.cancel_and_drain() {
                    self.absorb(&task, result, &mut progress, outcome);
                }
                cp.failed_days.extend(progress.failed_days.iter().copied());
                return Ok(ChunkResult::TimedOut);
            }
        }
        drop(batch);

        // every task has reported; publish whatever is left
        let mut years: BTreeSet<i32> = progress.behind_cursor.clone();
        years.extend(progress.retry.iter().copied());
        years.extend(progress.current_year);
        years.extend(progress.touched_keys.iter().map(|k| k.year));
        for year in years {
            if progress.finished.contains(&year) {
                continue;
            }
            if let Err(err) = self.upload_year(year, &progress.touched_keys) {
                self.checkpoint.save(cp)?;
                if let Err(close_err) = self.store.close_session() {
                    warn!("session close after failed upload also failed: {close_err:#}");
                }
                self.audit("year", "upload-failed", &format!("{year}: {err:#}"));
                return Err(err.context(format!("final upload for {year} in chunk {chunk} failed")));
            }
            self.record_year(chunk, year, cp, &mut progress, outcome)?;
        }

        self.write_summary(&chunk);
        self.regenerate_derived(&progress.finished);

        if !progress.failed_days.is_empty() {
            warn!(
                "chunk {chunk}: {} day(s) failed in years {:?}; kept for a later retry",
                progress.failed_days.len(),
                progress.failed_years
            );
            self.audit(
                "chunk",
                "failed-days",
                &format!("{chunk}: {:?}", progress.failed_days),
            );
        }
        cp.failed_days.extend(progress.failed_days.iter().copied());
        cp.complete_chunk(chunk);
        self.checkpoint.save(cp)?;
        outcome.chunks_completed += 1;
        outcome.chunks_completed_this_run += 1;
        outcome.chunks_remaining = outcome.chunks_total - outcome.chunks_completed;
        info!(
            "completed chunk {chunk} ({}/{})",
            outcome.chunks_completed, outcome.chunks_total
        );
        self.audit("chunk", "completed", &chunk.to_string());
        Ok(ChunkResult::Completed)
    }

    fn absorb(
        &self,
        task: &DayTask,
        result: Result<TaskOutcome>,
        progress: &mut ChunkProgress,
        outcome: &mut CampaignOutcome,
    ) {
        if let Some(left) = progress.outstanding.get_mut(&task.year()) {
            *left = left.saturating_sub(1);
        }
        outcome.tasks_run += 1;
        match result {
            Ok(done) => {
                if done.fetched > 0 {
                    log::debug!(
                        "{}: {} fetched ({} fresh), {} added",
                        task.date,
                        done.fetched,
                        done.fresh,
                        done.added
                    );
                }
                outcome.files_added += done.added;
                progress.touched_keys.extend(done.keys);
            }
            Err(err) => {
                outcome.failed_tasks += 1;
                progress.failed_days.insert(task.date);
                progress.failed_years.insert(task.year());
                warn::emit(WarnEvent {
                    code: "TASK_FAILED",
                    stage: "scheduler",
                    action: "fetch-day",
                    key: &task.date.to_string(),
                    retry: "next-run",
                    reason: "fetch-or-archive-error",
                    err: &format!("{err:#}"),
                });
            }
        }
    }

    /// Upload `year` for every configured category plus any other category
    /// written this chunk. All keys are attempted; the first error is returned.
    fn upload_year(&self, year: i32, touched: &BTreeSet<ArchiveKey>) -> Result<usize> {
        let mut keys: BTreeSet<ArchiveKey> = self
            .options
            .categories
            .iter()
            .map(|c| ArchiveKey::new(year, c.clone()))
            .collect();
        keys.extend(touched.iter().filter(|k| k.year == year).cloned());

        let mut parts = 0usize;
        let mut first_err = None;
        for key in &keys {
            match self.store.upload_key(key) {
                Ok(n) => parts += n,
                Err(err) => {
                    warn::emit(WarnEvent {
                        code: "UPLOAD_FAILED",
                        stage: "scheduler",
                        action: "upload-key",
                        key: &key.to_string(),
                        retry: "chunk-end",
                        reason: "store-error",
                        err: &format!("{err:#}"),
                    });
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(parts),
        }
    }

    fn finish_year_at_boundary(
        &self,
        chunk: DateRange,
        year: i32,
        cp: &mut ChunkCheckpoint,
        progress: &mut ChunkProgress,
        outcome: &mut CampaignOutcome,
    ) -> Result<()> {
        if progress.finished.contains(&year) {
            return Ok(());
        }
        match self.upload_year(year, &progress.touched_keys) {
            Ok(_) => {
                progress.retry.remove(&year);
                self.record_year(chunk, year, cp, progress, outcome)
            }
            Err(_) => {
                progress.retry.insert(year);
                Ok(())
            }
        }
    }

    /// Mark an uploaded year. It enters the checkpoint only when it belongs
    /// to this chunk and none of its tasks failed.
    fn record_year(
        &self,
        chunk: DateRange,
        year: i32,
        cp: &mut ChunkCheckpoint,
        progress: &mut ChunkProgress,
        outcome: &mut CampaignOutcome,
    ) -> Result<()> {
        progress.finished.insert(year);
        if !outcome.years_uploaded.contains(&year) {
            outcome.years_uploaded.push(year);
        }
        let in_chunk = chunk.years().contains(&year);
        if in_chunk && !progress.failed_years.contains(&year) {
            cp.mark_year_completed(year);
            self.checkpoint.save(cp)?;
            info!("year {year} uploaded and checkpointed");
            self.audit("year", "uploaded", &year.to_string());
        }
        Ok(())
    }

    fn write_summary(&self, chunk: &DateRange) {
        let changes = self.store.drain_session_changes();
        let summary = ChunkSummary::build(chunk, &changes);
        summary.log();
        if let Some(writer) = &self.summaries
            && let Err(err) = writer.write(&summary)
        {
            warn!("failed to write change summary for {chunk}: {err:#}");
        }
    }

    fn regenerate_derived(&self, years: &BTreeSet<i32>) {
        let Some(derived) = &self.derived else {
            return;
        };
        if years.is_empty() {
            return;
        }
        match derived.regenerate(years) {
            Ok(n) => info!("derived output regenerated for {years:?}: {n} records"),
            Err(err) => warn::emit(WarnEvent {
                code: "DERIVED_FAILED",
                stage: "export",
                action: "regenerate",
                key: &format!("{years:?}"),
                retry: "manual-export",
                reason: "export-error",
                err: &format!("{err:#}"),
            }),
        }
    }
}
