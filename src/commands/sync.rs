use anyhow::{Result, bail};

use crate::commands::backfill::{CampaignKind, RunOverrides, day_after, run_campaign};
use crate::commands::{CommandReport, open_vault};
use crate::vault::audit::AuditLog;
use crate::vault::checkpoint::CheckpointFile;
use crate::vault::chunks::DateRange;
use crate::vault::config::validate;
use crate::vault::latest::latest_archived_date;
use crate::vault::lock::CampaignLock;
use crate::vault::util::{now_in, parse_timezone};

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub overrides: RunOverrides,
}

/// Archive everything after the newest published day, up to and including
/// today. An interrupted sync resumes its own checkpoint first.
pub fn run(opts: &SyncOptions) -> Result<CommandReport> {
    let mut ctx = open_vault()?;
    opts.overrides.apply(&mut ctx.config);
    validate(&ctx.config)?;

    let lock = CampaignLock::acquire(&ctx.paths.lock_file())?;
    let audit = AuditLog::new(&ctx.paths.logs_dir);
    let tz = parse_timezone(&ctx.config.store.timezone)?;
    let today = now_in(tz).date_naive();

    let mut report = CommandReport::new("sync");
    report.detail(format!("lock={}", lock.path().display()));
    report.detail(format!("today={today}"));

    let pending = CheckpointFile::new(ctx.paths.sync_checkpoint_file()).load()?;
    let requested = match pending {
        Some(cp) => {
            let overall = cp.overall()?;
            report.detail(format!("resuming interrupted sync {overall}"));
            overall
        }
        None => {
            let Some(latest) = latest_archived_date(ctx.remote.as_ref(), tz)? else {
                bail!("remote archive has no indexes yet; run backfill first");
            };
            report.detail(format!(
                "latest_archived={} (from {})",
                latest.date,
                latest.key.index_key()
            ));
            if latest.date >= today {
                report.detail("sync=up-to-date");
                audit.record("sync", "up-to-date", &latest.date.to_string());
                return Ok(report);
            }
            DateRange::new(day_after(latest.date)?, day_after(today)?)?
        }
    };

    report.merge(run_campaign(&ctx, CampaignKind::Sync, requested, &audit)?);
    Ok(report)
}
