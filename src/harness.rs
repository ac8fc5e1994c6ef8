use crate::config::load_calendars_from_dir;
use crate::pipeline::{SyncOptions, sync_calendars};
use crate::store::{ledger_path, load_ledger};
use crate::walker::AbortSignal;
use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct HarnessOptions {
    pub config_dir: PathBuf,
    pub state_dir: PathBuf,
    pub today: Option<NaiveDate>,
}

/// Two back-to-back syncs from a clean state; the second must be all skips.
#[derive(Debug, Clone, Serialize)]
pub struct HarnessReport {
    pub calendars: usize,
    pub calendars_failed: usize,
    pub first_run_created: usize,
    pub first_run_updated: usize,
    pub first_run_skipped: usize,
    pub first_run_failed: usize,
    pub second_run_created: usize,
    pub second_run_updated: usize,
    pub second_run_skipped: usize,
    pub second_run_failed: usize,
    pub synthetic_events: usize,
    pub total_ledger_events: usize,
}

impl HarnessReport {
    pub fn is_idempotent(&self) -> bool {
        self.calendars_failed == 0
            && self.second_run_created == 0
            && self.second_run_updated == 0
            && self.second_run_failed == 0
    }
}

/// Runs in `<state_dir>/harness` so real ledgers beside it are never touched.
pub fn run_harness(options: &HarnessOptions) -> Result<HarnessReport> {
    let state_dir = harness_state_dir(&options.state_dir);
    if state_dir.exists() {
        std::fs::remove_dir_all(&state_dir)
            .with_context(|| format!("failed to clear {}", state_dir.display()))?;
    }

    let sync = SyncOptions {
        config_dir: options.config_dir.clone(),
        state_dir: state_dir.clone(),
        calendar: None,
        dry_run: false,
        today: options.today,
        abort: AbortSignal::new(),
    };
    let first = sync_calendars(&sync)?;
    let second = sync_calendars(&sync)?;

    let mut total_ledger_events = 0usize;
    for calendar in load_calendars_from_dir(&options.config_dir)? {
        let path = ledger_path(
            &state_dir,
            &calendar.config.sanitized_calendar_dir_name(),
        );
        total_ledger_events += load_ledger(&path, calendar.key())?.len();
    }

    Ok(HarnessReport {
        calendars: first.len(),
        calendars_failed: first
            .iter()
            .chain(second.iter())
            .filter(|r| r.is_failed())
            .count(),
        first_run_created: first.iter().map(|r| r.reconciliation.created).sum(),
        first_run_updated: first.iter().map(|r| r.reconciliation.updated).sum(),
        first_run_skipped: first.iter().map(|r| r.reconciliation.skipped).sum(),
        first_run_failed: first.iter().map(|r| r.reconciliation.failed).sum(),
        second_run_created: second.iter().map(|r| r.reconciliation.created).sum(),
        second_run_updated: second.iter().map(|r| r.reconciliation.updated).sum(),
        second_run_skipped: second.iter().map(|r| r.reconciliation.skipped).sum(),
        second_run_failed: second.iter().map(|r| r.reconciliation.failed).sum(),
        synthetic_events: first.iter().map(|r| r.synthetic_events).sum(),
        total_ledger_events,
    })
}

pub fn harness_state_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("harness")
}
