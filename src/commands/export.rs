use anyhow::{Result, bail};
use std::collections::BTreeSet;

use crate::commands::{CommandReport, open_vault};
use crate::vault::derived::{DerivedOutput, JsonlRecordSink, MetadataExporter};

#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    pub years: Vec<i32>,
}

pub fn run(opts: &ExportOptions) -> Result<CommandReport> {
    if opts.years.is_empty() {
        bail!("export needs at least one --year");
    }
    let ctx = open_vault()?;
    let mut report = CommandReport::new("export");
    if !ctx.config.export.enabled {
        report.detail("export.enabled=false in config; running anyway on request");
    }

    let exporter = MetadataExporter::new(
        ctx.remote.clone(),
        Box::new(JsonlRecordSink::new(ctx.remote.clone())),
        &ctx.config.export.primary_key,
        ctx.paths.work_dir.join("export"),
    );
    let years: BTreeSet<i32> = opts.years.iter().copied().collect();
    let records = exporter.regenerate(&years)?;

    report.detail(format!("primary_key={}", ctx.config.export.primary_key));
    for year in &years {
        report.detail(format!("output={}", JsonlRecordSink::object_key(*year)));
    }
    report.detail(format!("records_exported={records}"));
    Ok(report)
}
