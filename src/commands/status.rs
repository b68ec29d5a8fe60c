use anyhow::Result;
use std::env;

use crate::commands::{CommandReport, open_vault};
use crate::vault::checkpoint::CheckpointFile;
use crate::vault::chunks::plan_chunks;
use crate::vault::lock::{is_held, read_payload};
use crate::vault::scheduler::CampaignState;

include!(concat!(env!("OUT_DIR"), "/env_allowlist.rs"));

pub fn run() -> Result<CommandReport> {
    let ctx = open_vault()?;
    let paths = &ctx.paths;
    let cfg = &ctx.config;
    let mut report = CommandReport::new("status");

    report.detail(format!("vault_home={}", paths.vault_home.display()));
    report.detail(format!("work_dir={}", paths.work_dir.display()));
    report.detail(format!("staging_dir={}", paths.staging_dir.display()));
    report.detail(format!("logs_dir={}", paths.logs_dir.display()));
    report.detail(format!("remote.backend={}", ctx.remote.label()));
    report.detail(format!(
        "store.max_part_size_bytes={}",
        cfg.store.max_part_size_bytes
    ));
    report.detail(format!("store.upload_mode={}", cfg.store.upload_mode.as_str()));
    report.detail(format!("store.timezone={}", cfg.store.timezone));
    report.detail(format!("scheduler.chunk_years={}", cfg.scheduler.chunk_years));
    report.detail(format!("scheduler.workers={}", cfg.scheduler.workers));
    report.detail(format!(
        "scheduler.categories={}",
        cfg.scheduler.categories.join(",")
    ));
    if let Some(hours) = cfg.scheduler.timeout_hours {
        report.detail(format!("scheduler.timeout_hours={hours}"));
    }
    report.detail(format!("build_uuid={}", env!("BUILD_UUID")));

    let overrides: Vec<&str> = GENERATED_ENV_ALLOWLIST
        .iter()
        .copied()
        .filter(|key| env::var_os(key).is_some())
        .collect();
    if !overrides.is_empty() {
        report.detail(format!("env_overrides={}", overrides.join(",")));
    }

    let lock_path = paths.lock_file();
    let lock_held = is_held(&lock_path);

    let backfill = describe_checkpoint(
        &mut report,
        "checkpoint",
        &CheckpointFile::new(paths.checkpoint_file()),
        cfg.scheduler.chunk_years,
    )?;
    let state = match (backfill, lock_held) {
        (_, true) => CampaignState::Running,
        (true, false) => CampaignState::Suspended,
        (false, false) => CampaignState::NotStarted,
    };
    report.detail(format!("campaign.state={}", state.as_str()));

    if describe_checkpoint(
        &mut report,
        "sync_checkpoint",
        &CheckpointFile::new(paths.sync_checkpoint_file()),
        cfg.scheduler.chunk_years,
    )? {
        report.detail("sync=interrupted; rerun sync to resume");
    }

    if lock_held {
        report.detail("backfill.lock=held");
        match read_payload(&lock_path) {
            Some(payload) => {
                report.detail(format!("backfill.pid={}", payload.pid));
                report.detail(format!("backfill.start_time={}", payload.start_time));
                if payload.build_uuid == env!("BUILD_UUID") {
                    report.detail("backfill.build_match=ok");
                } else {
                    report.detail(format!(
                        "backfill.build_mismatch (lock={} current={})",
                        payload.build_uuid,
                        env!("BUILD_UUID")
                    ));
                }
            }
            None => report.detail("backfill.payload=unreadable"),
        }
    } else {
        report.detail("backfill.lock=free");
    }

    if !paths.staging_dir.exists() {
        report.detail("staging_dir missing; backfill will find nothing to import");
    }

    Ok(report)
}

/// Report one progress file under `label`; true when a run is pending.
fn describe_checkpoint(
    report: &mut CommandReport,
    label: &str,
    file: &CheckpointFile,
    chunk_years: u32,
) -> Result<bool> {
    match file.load() {
        Ok(None) => {
            report.detail(format!("{label}=none (no campaign in progress)"));
            Ok(false)
        }
        Ok(Some(cp)) => {
            let overall = cp.overall()?;
            report.detail(format!("{label}.campaign={overall}"));
            match plan_chunks(overall, chunk_years) {
                Ok(chunks) => {
                    let done = chunks.iter().filter(|c| cp.is_chunk_completed(c)).count();
                    report.detail(format!("{label}.chunks={done}/{}", chunks.len()));
                }
                Err(err) => report.issue(format!("{label}.chunks=unplannable ({err})")),
            }
            if let Some(chunk) = cp.current_chunk {
                let years: Vec<String> = cp
                    .completed_years_in_current_chunk
                    .iter()
                    .map(i32::to_string)
                    .collect();
                report.detail(format!("{label}.current_chunk={chunk}"));
                report.detail(format!("{label}.completed_years={}", years.join(",")));
            }
            if !cp.failed_days.is_empty() {
                report.detail(format!("{label}.failed_days={}", cp.failed_days.len()));
            }
            report.detail(format!("{label}.last_updated={}", cp.last_updated));
            Ok(true)
        }
        Err(err) => {
            report.issue(format!("{label}=corrupt ({err:#})"));
            Ok(true)
        }
    }
}
