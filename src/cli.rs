use anyhow::Result;
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};

use crate::commands::backfill::RunOverrides;
use crate::commands::{self, CommandReport};
use crate::vault::config::UploadMode;
use crate::vault::verify::VerifyOptions;

#[derive(Parser)]
#[command(
    name = "courtvault",
    version,
    about = "Partitioned archive store and resumable backfill for court judgments",
    after_help = "\
Environment variables:
  COURTVAULT_HOME          Root for work, remote, staging and logs dirs (default ~/courtvault)
  COURTVAULT_CONFIG_PATH   TOML config file (default ~/.courtvault/courtvault.toml)
  COURTVAULT_LOG           Log filter, RUST_LOG syntax (default info)"
)]
pub(crate) struct Cli {
    /// Print the report as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Clone, Copy)]
pub(crate) struct RunArgs {
    /// Concurrent fetch workers
    #[arg(long)]
    workers: Option<usize>,

    /// Wall-clock budget; the run suspends cleanly when it is spent
    #[arg(long)]
    timeout_hours: Option<f64>,

    /// Years per chunk
    #[arg(long)]
    chunk_years: Option<u32>,

    /// immediate or batch
    #[arg(long)]
    upload_mode: Option<UploadMode>,
}

impl From<RunArgs> for RunOverrides {
    fn from(args: RunArgs) -> Self {
        Self {
            workers: args.workers,
            timeout_hours: args.timeout_hours,
            chunk_years: args.chunk_years,
            upload_mode: args.upload_mode,
        }
    }
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run or resume the backfill campaign
    Backfill {
        /// First day of a new campaign (YYYY-MM-DD); ignored when resuming
        #[arg(long)]
        start: Option<NaiveDate>,

        /// Day after the last day of a new campaign (YYYY-MM-DD)
        #[arg(long)]
        end: Option<NaiveDate>,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Archive everything newer than the latest published day, up to today
    Sync {
        #[command(flatten)]
        run: RunArgs,
    },

    /// Show paths, config and campaign progress
    Status,

    /// Compare every index with the containers in the remote store
    Verify {
        /// Only check these years
        #[arg(long = "year")]
        years: Vec<i32>,

        /// Also download parts and check their sha256
        #[arg(long)]
        strict: bool,
    },

    /// Rewrite flat legacy indexes into the parts layout
    MigrateIndex {
        /// Report what would change without writing
        #[arg(long)]
        dry_run: bool,
    },

    /// Regenerate the JSONL metadata export for some years
    Export {
        #[arg(long = "year", required = true)]
        years: Vec<i32>,
    },
}

fn print_report(report: &CommandReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!("{}: {}", report.command, if report.ok { "ok" } else { "failed" });
    for line in &report.details {
        println!("  {line}");
    }
    for line in &report.issues {
        println!("  ! {line}");
    }
    Ok(())
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let report = match cli.command {
        Command::Backfill { start, end, run } => {
            commands::backfill::run(&commands::backfill::BackfillOptions {
                start,
                end,
                overrides: run.into(),
            })?
        }
        Command::Sync { run } => commands::sync::run(&commands::sync::SyncOptions {
            overrides: run.into(),
        })?,
        Command::Status => commands::status::run()?,
        Command::Verify { years, strict } => {
            commands::verify::run(&VerifyOptions { years, strict })?
        }
        Command::MigrateIndex { dry_run } => {
            commands::migrate_index::run(&commands::migrate_index::MigrateOptions { dry_run })?
        }
        Command::Export { years } => {
            commands::export::run(&commands::export::ExportOptions { years })?
        }
    };

    print_report(&report, cli.json)?;
    if !report.ok {
        std::process::exit(2);
    }
    Ok(())
}
