use anyhow::Result;

use crate::commands::{CommandReport, open_vault};
use crate::vault::verify::{PartProblem, VerifyOptions, verify_store};

pub fn run(opts: &VerifyOptions) -> Result<CommandReport> {
    let ctx = open_vault()?;
    let mut report = CommandReport::new("verify");

    let result = verify_store(ctx.remote.as_ref(), opts)?;
    report.detail(format!("indexes={}", result.indexes));
    report.detail(format!("parts_checked={}", result.parts_checked));
    if opts.strict {
        report.detail("digests=checked");
    }
    for index in &result.legacy_indexes {
        report.detail(format!("legacy_index={index} (run migrate-index)"));
    }
    for line in &result.unreadable {
        report.issue(format!("unreadable index {line}"));
    }
    for finding in &result.findings {
        let what = match &finding.problem {
            PartProblem::Missing => "container missing".to_string(),
            PartProblem::SizeMismatch { recorded, actual } => {
                format!("size mismatch (index={recorded} remote={actual})")
            }
            PartProblem::DigestMismatch { recorded, actual } => {
                format!("sha256 mismatch (index={recorded} remote={actual})")
            }
        };
        report.issue(format!("{} part {}: {what}", finding.index_key, finding.part));
    }
    if result.is_clean() {
        report.detail("verify=ok");
    }
    Ok(report)
}
