use anyhow::{Result, anyhow};
use chrono::{Days, NaiveDate};
use std::sync::Arc;
use std::time::Duration;

use crate::commands::{CommandReport, VaultContext, open_vault};
use crate::error::VaultError;
use crate::vault::audit::AuditLog;
use crate::vault::checkpoint::CheckpointFile;
use crate::vault::chunks::DateRange;
use crate::vault::config::{UploadMode, VaultConfig, validate};
use crate::vault::derived::{JsonlRecordSink, MetadataExporter};
use crate::vault::fetcher::StagingFetcher;
use crate::vault::lock::CampaignLock;
use crate::vault::scheduler::{CampaignState, ChunkScheduler, SchedulerOptions};
use crate::vault::store::{PartitionedArchiveStore, StoreSettings};
use crate::vault::summary::ChangeSummaryWriter;
use crate::vault::util::{now_in, parse_timezone};

/// Command-line overrides shared by `backfill` and `sync`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOverrides {
    pub workers: Option<usize>,
    pub timeout_hours: Option<f64>,
    pub chunk_years: Option<u32>,
    pub upload_mode: Option<UploadMode>,
}

impl RunOverrides {
    pub(crate) fn apply(&self, cfg: &mut VaultConfig) {
        if let Some(workers) = self.workers {
            cfg.scheduler.workers = workers;
        }
        if let Some(hours) = self.timeout_hours {
            cfg.scheduler.timeout_hours = Some(hours);
        }
        if let Some(years) = self.chunk_years {
            cfg.scheduler.chunk_years = years;
        }
        if let Some(mode) = self.upload_mode {
            cfg.store.upload_mode = mode;
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackfillOptions {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub overrides: RunOverrides,
}

/// Backfill and sync share the scheduler but keep separate progress files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CampaignKind {
    Backfill,
    Sync,
}

impl CampaignKind {
    fn command(self) -> &'static str {
        match self {
            Self::Backfill => "backfill",
            Self::Sync => "sync",
        }
    }

    fn checkpoint(self, ctx: &VaultContext) -> CheckpointFile {
        match self {
            Self::Backfill => CheckpointFile::new(ctx.paths.checkpoint_file()),
            Self::Sync => CheckpointFile::new(ctx.paths.sync_checkpoint_file()),
        }
    }

    fn summaries(self, ctx: &VaultContext) -> ChangeSummaryWriter {
        match self {
            Self::Backfill => ChangeSummaryWriter::new(&ctx.paths.work_dir),
            Self::Sync => ChangeSummaryWriter::for_sync(&ctx.paths.work_dir),
        }
    }
}

fn join_years(years: &[i32]) -> String {
    years
        .iter()
        .map(i32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn time_budget(cfg: &VaultConfig) -> Result<Option<Duration>> {
    cfg.scheduler
        .timeout_hours
        .map(|hours| {
            Duration::try_from_secs_f64(hours * 3600.0).map_err(|err| {
                anyhow::Error::from(VaultError::InvalidConfig(format!(
                    "scheduler.timeout_hours={hours}: {err}"
                )))
            })
        })
        .transpose()
}

pub(crate) fn day_after(date: NaiveDate) -> Result<NaiveDate> {
    date.checked_add_days(Days::new(1))
        .ok_or_else(|| anyhow!("no day after {date}"))
}

/// Wire the store, fetcher and scheduler for `kind`, run it over `requested`
/// and describe the outcome.
pub(crate) fn run_campaign(
    ctx: &VaultContext,
    kind: CampaignKind,
    requested: DateRange,
    audit: &AuditLog,
) -> Result<CommandReport> {
    let settings = StoreSettings::from_config(&ctx.config.store)?;
    let categories = ctx.config.categories()?;
    let store = Arc::new(PartitionedArchiveStore::new(
        ctx.remote.clone(),
        ctx.paths.containers_dir(),
        settings,
    ));
    let fetcher = Arc::new(StagingFetcher::new(&ctx.paths.staging_dir, categories.clone()));
    let options = SchedulerOptions {
        chunk_years: ctx.config.scheduler.chunk_years,
        workers: ctx.config.scheduler.workers,
        timeout: time_budget(&ctx.config)?,
        categories,
    };

    let mut scheduler = ChunkScheduler::new(store, fetcher, kind.checkpoint(ctx), options)
        .with_summaries(kind.summaries(ctx))
        .with_audit(audit.clone());
    if ctx.config.export.enabled {
        scheduler = scheduler.with_derived(Box::new(MetadataExporter::new(
            ctx.remote.clone(),
            Box::new(JsonlRecordSink::new(ctx.remote.clone())),
            &ctx.config.export.primary_key,
            ctx.paths.work_dir.join("export"),
        )));
    }

    let outcome = scheduler.run(requested)?;

    let mut report = CommandReport::new(kind.command());
    report.detail(format!("campaign={}", outcome.overall));
    report.detail(format!("resumed={}", outcome.resumed));
    report.detail(format!(
        "chunks={}/{} completed ({} this run, {} remaining)",
        outcome.chunks_completed,
        outcome.chunks_total,
        outcome.chunks_completed_this_run,
        outcome.chunks_remaining
    ));
    if !outcome.skipped_years.is_empty() {
        report.detail(format!(
            "skipped_years={} (finished by an earlier run)",
            join_years(&outcome.skipped_years)
        ));
    }
    report.detail(format!("years_uploaded={}", join_years(&outcome.years_uploaded)));
    report.detail(format!("tasks_run={}", outcome.tasks_run));
    if outcome.retried_days > 0 {
        report.detail(format!("retried_days={}", outcome.retried_days));
    }
    report.detail(format!("files_added={}", outcome.files_added));
    report.detail(format!("state={}", outcome.state.as_str()));

    match outcome.state {
        CampaignState::Completed => {}
        CampaignState::Suspended => {
            report.detail("reason=timeout");
            if !outcome.open_years.is_empty() {
                report.detail(format!("open_years={}", join_years(&outcome.open_years)));
            }
            report.detail(format!("rerun {} to resume from the checkpoint", kind.command()));
        }
        state => report.issue(format!("scheduler returned in unexpected state {state:?}")),
    }
    if !outcome.failed_days.is_empty() {
        let days: Vec<String> = outcome.failed_days.iter().map(NaiveDate::to_string).collect();
        let hint = match (outcome.state, outcome.failed_days.first()) {
            (CampaignState::Completed, Some(first)) => format!(
                "; refetch with `courtvault backfill --start {first} --end {}`",
                day_after(*first)?
            ),
            _ => "; retried on the next run".to_string(),
        };
        report.issue(format!(
            "{} day(s) failed to fetch: {}{hint}",
            days.len(),
            days.join(",")
        ));
    }
    Ok(report)
}

pub fn run(opts: &BackfillOptions) -> Result<CommandReport> {
    let mut ctx = open_vault()?;
    opts.overrides.apply(&mut ctx.config);
    validate(&ctx.config)?;

    let lock = CampaignLock::acquire(&ctx.paths.lock_file())?;
    let audit = AuditLog::new(&ctx.paths.logs_dir);

    let start = match opts.start {
        Some(start) => start,
        None => ctx.config.campaign_start()?,
    };
    let end = match opts.end {
        Some(end) => end,
        None => day_after(now_in(parse_timezone(&ctx.config.store.timezone)?).date_naive())?,
    };
    let requested = DateRange::new(start, end)?;

    let mut report = run_campaign(&ctx, CampaignKind::Backfill, requested, &audit)?;
    report.detail(format!("lock={}", lock.path().display()));
    report.detail(format!("audit_log={}", audit.path().display()));
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_budget_rejects_overflowing_hours() {
        let mut cfg = VaultConfig::default();
        assert_eq!(time_budget(&cfg).unwrap(), None);

        cfg.scheduler.timeout_hours = Some(1.5);
        assert_eq!(time_budget(&cfg).unwrap(), Some(Duration::from_secs(5400)));

        cfg.scheduler.timeout_hours = Some(1e300);
        let err = time_budget(&cfg).unwrap_err();
        assert!(err.to_string().contains("timeout_hours"));
    }
}
