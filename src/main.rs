use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use fcsync::harness::{HarnessOptions, run_harness};
use fcsync::pipeline::{
    ExportOptions, SyncOptions, ValidateOptions, export_calendars, sync_calendars,
    validate_configs,
};
use fcsync::walker::AbortSignal;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "fcsync",
    about = "Scrape FullCalendar month grids and reconcile them into a calendar"
)]
struct Cli {
    #[arg(long, default_value = "configs/calendars")]
    config_dir: PathBuf,

    #[arg(long, default_value = "data/state")]
    state_dir: PathBuf,

    #[arg(long, default_value = "data/out")]
    out_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Sync {
        #[arg(long)]
        calendar: Option<String>,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        /// Anchor date for recurrence expansion (YYYY-MM-DD).
        #[arg(long)]
        today: Option<NaiveDate>,
    },
    Export {
        #[arg(long)]
        calendar: Option<String>,
        #[arg(long)]
        today: Option<NaiveDate>,
    },
    Validate {
        #[arg(long)]
        file: Option<PathBuf>,
    },
    Harness {
        #[arg(long)]
        today: Option<NaiveDate>,
    },
}

fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Sync {
            calendar,
            dry_run,
            today,
        } => {
            let reports = sync_calendars(&SyncOptions {
                config_dir: cli.config_dir,
                state_dir: cli.state_dir,
                calendar,
                dry_run,
                today,
                abort: AbortSignal::new(),
            })?;

            for report in &reports {
                if let Some(error) = &report.error {
                    warn!(calendar = %report.calendar_key, error = %error, "calendar sync failed");
                    continue;
                }
                info!(
                    calendar = %report.calendar_key,
                    pages = report.pages_walked,
                    scraped = report.events_scraped,
                    duplicates = report.duplicates_dropped,
                    patterns = report.patterns,
                    synthetic = report.synthetic_events,
                    created = report.reconciliation.created,
                    updated = report.reconciliation.updated,
                    skipped = report.reconciliation.skipped,
                    failed = report.reconciliation.failed,
                    "calendar sync summary"
                );
                for record in report.reconciliation.failures() {
                    warn!(
                        calendar = %report.calendar_key,
                        title = %record.title,
                        start = %record.start,
                        error = record.error.as_deref().unwrap_or_default(),
                        "event not reconciled"
                    );
                }
            }

            let failed = reports.iter().filter(|r| r.is_failed()).count();
            if failed > 0 {
                anyhow::bail!("{failed} of {} calendar passes failed", reports.len());
            }
        }
        Commands::Export { calendar, today } => {
            let written = export_calendars(&ExportOptions {
                config_dir: cli.config_dir,
                out_dir: cli.out_dir,
                calendar,
                today,
            })?;
            info!(files = written.len(), "export complete");
        }
        Commands::Validate { file } => {
            let messages = validate_configs(&ValidateOptions {
                config_dir: Some(cli.config_dir),
                source_file: file,
            })?;
            for line in messages {
                println!("{line}");
            }
        }
        Commands::Harness { today } => {
            let report = run_harness(&HarnessOptions {
                config_dir: cli.config_dir,
                state_dir: cli.state_dir,
                today,
            })?;

            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_idempotent() {
                anyhow::bail!("second pass was not idempotent");
            }
        }
    }

    Ok(())
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}
