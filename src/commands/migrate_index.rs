use anyhow::Result;

use crate::commands::{CommandReport, open_vault};
use crate::vault::migrate::{MigrationOutcome, migrate_indexes};
use crate::vault::util::{now_iso, parse_timezone};

#[derive(Debug, Clone, Default)]
pub struct MigrateOptions {
    pub dry_run: bool,
}

pub fn run(opts: &MigrateOptions) -> Result<CommandReport> {
    let ctx = open_vault()?;
    let tz = parse_timezone(&ctx.config.store.timezone)?;
    let mut report = CommandReport::new("migrate-index");
    if opts.dry_run {
        report.detail("dry_run=true (nothing will be written)");
    }

    let entries = migrate_indexes(ctx.remote.as_ref(), opts.dry_run, &now_iso(tz))?;
    let mut upgraded = 0usize;
    let mut current = 0usize;
    for entry in &entries {
        match &entry.outcome {
            MigrationOutcome::Current => current += 1,
            MigrationOutcome::Empty => {
                report.detail(format!("{}: legacy layout with no files, left as is", entry.index_key));
            }
            MigrationOutcome::Upgraded { files, size_bytes } => {
                upgraded += 1;
                report.detail(format!("{}: upgraded ({files} files, {size_bytes} bytes)", entry.index_key));
            }
            MigrationOutcome::WouldUpgrade { files, size_bytes } => {
                upgraded += 1;
                report.detail(format!(
                    "{}: would upgrade ({files} files, {size_bytes} bytes)",
                    entry.index_key
                ));
            }
            MigrationOutcome::Skipped { reason } => {
                report.issue(format!("{}: skipped ({reason})", entry.index_key));
            }
        }
    }
    report.detail(format!(
        "indexes={} current={current} upgraded={upgraded}",
        entries.len()
    ));
    Ok(report)
}
