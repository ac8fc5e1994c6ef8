use crate::config::{CalendarConfig, LoadedCalendar, load_calendar_file, load_calendars_from_dir};
use crate::extract::FieldExtractor;
use crate::ics::write_calendar_preview;
use crate::model::{CalendarRunReport, CanonicalEvent, ExtractionStats, RecurrencePattern};
use crate::normalize::Normalizer;
use crate::reconcile::{EventMapping, ReconcileMode, Reconciler, RemoteStore, fingerprint};
use crate::recurrence::RecurrenceDetector;
use crate::source::open_page_source;
use crate::store::{CalendarLock, ledger_path, load_ledger, save_ledger};
use crate::walker::{AbortSignal, PageSource, WalkLimits, walk};
use anyhow::{Context, Result, bail};
use chrono::{NaiveDate, Utc};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub config_dir: PathBuf,
    pub state_dir: PathBuf,
    pub calendar: Option<String>,
    pub dry_run: bool,
    pub today: Option<NaiveDate>,
    pub abort: AbortSignal,
}

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub config_dir: PathBuf,
    pub out_dir: PathBuf,
    pub calendar: Option<String>,
    pub today: Option<NaiveDate>,
}

#[derive(Debug, Clone)]
pub struct ValidateOptions {
    pub config_dir: Option<PathBuf>,
    pub source_file: Option<PathBuf>,
}

/// Everything one walk produced before reconciliation.
#[derive(Debug, Clone, Default)]
pub struct CollectedEvents {
    pub pages_walked: usize,
    pub stats: ExtractionStats,
    pub events_scraped: usize,
    pub duplicates_dropped: usize,
    pub patterns: Vec<RecurrencePattern>,
    pub synthetic: usize,
    pub events: Vec<CanonicalEvent>,
}

pub fn sync_calendars(options: &SyncOptions) -> Result<Vec<CalendarRunReport>> {
    let calendars = select_calendars(&options.config_dir, options.calendar.as_deref())?;
    let mode = if options.dry_run {
        ReconcileMode::DryRun
    } else {
        ReconcileMode::Apply
    };

    let mut reports = Vec::new();
    for calendar in calendars {
        if !calendar.config.calendar.enabled {
            info!(calendar = %calendar.key(), "calendar disabled; skipping");
            continue;
        }
        if options.abort.is_aborted() {
            info!("sync aborted before remaining calendars");
            break;
        }

        info!(calendar = %calendar.key(), "sync start");
        match sync_calendar(&calendar, options, mode) {
            Ok(report) => reports.push(report),
            Err(err) => {
                let message = format!("{err:#}");
                warn!(calendar = %calendar.key(), error = %message, "calendar pass failed; continuing");
                reports.push(CalendarRunReport::failed(calendar.key(), message));
            }
        }
    }

    Ok(reports)
}

fn sync_calendar(
    calendar: &LoadedCalendar,
    options: &SyncOptions,
    mode: ReconcileMode,
) -> Result<CalendarRunReport> {
    let path = ledger_path(
        &options.state_dir,
        &calendar.config.sanitized_calendar_dir_name(),
    );
    let _lock = CalendarLock::acquire(&path)?;
    let mut ledger = load_ledger(&path, calendar.key())?;

    let source = open_page_source(calendar)
        .with_context(|| format!("page source failed for calendar {}", calendar.key()))?;
    let today = match options.today {
        Some(today) => today,
        None => today_in(&calendar.config)?,
    };
    let report = run_calendar_pass(
        &calendar.config,
        source,
        &mut ledger,
        mode,
        today,
        options.abort.clone(),
    )?;

    if mode == ReconcileMode::Apply {
        save_ledger(&path, &ledger)?;
        info!(ledger = %path.display(), events = ledger.len(), "ledger written");
    } else {
        info!("dry run enabled; ledger not persisted");
    }

    Ok(report)
}

/// One isolated pass: walk, infer recurrence, reconcile against `store`.
pub fn run_calendar_pass<S: PageSource, R: RemoteStore + ?Sized>(
    calendar: &CalendarConfig,
    source: S,
    store: &mut R,
    mode: ReconcileMode,
    today: NaiveDate,
    abort: AbortSignal,
) -> Result<CalendarRunReport> {
    let collected = collect_events(calendar, source, today, abort)?;

    let reconciler = Reconciler::new(
        EventMapping {
            timezone: calendar.calendar.source_timezone.clone(),
            location: calendar.calendar.location.clone(),
        },
        mode,
    );
    let reconciliation = reconciler.reconcile(&collected.events, store);

    let report = CalendarRunReport {
        calendar_key: calendar.calendar.key.clone(),
        pages_walked: collected.pages_walked,
        stats: collected.stats,
        events_scraped: collected.events_scraped,
        duplicates_dropped: collected.duplicates_dropped,
        patterns: collected.patterns.len(),
        synthetic_events: collected.synthetic,
        reconciliation,
        error: None,
    };

    info!(
        calendar = %report.calendar_key,
        pages = report.pages_walked,
        scraped = report.events_scraped,
        synthetic = report.synthetic_events,
        dropped_unresolvable = report.stats.unresolvable,
        dropped_missing_date = report.stats.date_context_missing,
        malformed_time = report.stats.malformed_time,
        created = report.reconciliation.created,
        updated = report.reconciliation.updated,
        skipped = report.reconciliation.skipped,
        failed = report.reconciliation.failed,
        "calendar pass complete"
    );

    Ok(report)
}

pub fn collect_events<S: PageSource>(
    calendar: &CalendarConfig,
    source: S,
    today: NaiveDate,
    abort: AbortSignal,
) -> Result<CollectedEvents> {
    let extractor = FieldExtractor::new(&calendar.extract)?;
    let normalizer = Normalizer::new(
        calendar.timezone()?,
        calendar.time.default_duration_minutes,
    );
    let detector = RecurrenceDetector::new(
        calendar.known_patterns()?,
        normalizer,
        calendar.recurrence.recurrence_horizon_weeks,
    );

    let mut collected = CollectedEvents::default();
    let mut seen = HashSet::new();
    let mut scraped = Vec::new();

    for batch in walk(
        source,
        extractor,
        normalizer,
        WalkLimits::from(calendar.walk),
        abort,
    ) {
        collected.pages_walked += 1;
        collected.stats.absorb(&batch.stats);
        for event in batch.events {
            if seen.insert(fingerprint(&event)) {
                scraped.push(event);
            } else {
                debug!(page = %batch.label, title = %event.title, "duplicate fragment from adjacent month");
                collected.duplicates_dropped += 1;
            }
        }
    }

    collected.events_scraped = scraped.len();
    let outcome = detector.infer(scraped, today);
    collected.patterns = outcome.patterns;
    collected.synthetic = outcome.synthetic;
    collected.events = outcome.events;
    Ok(collected)
}

pub fn export_calendars(options: &ExportOptions) -> Result<Vec<PathBuf>> {
    let calendars = select_calendars(&options.config_dir, options.calendar.as_deref())?;
    let mut written = Vec::new();

    for calendar in calendars.into_iter().filter(|c| c.config.calendar.enabled) {
        let source = open_page_source(&calendar)
            .with_context(|| format!("page source failed for calendar {}", calendar.key()))?;
        let today = match options.today {
            Some(today) => today,
            None => today_in(&calendar.config)?,
        };
        let collected = collect_events(&calendar.config, source, today, AbortSignal::new())?;

        let path = options
            .out_dir
            .join(format!("{}.ics", calendar.config.sanitized_calendar_dir_name()));
        write_calendar_preview(&calendar.config, &collected.events, &path)?;
        info!(
            calendar = %calendar.key(),
            events = collected.events.len(),
            file = %path.display(),
            "calendar preview written"
        );
        written.push(path);
    }

    Ok(written)
}

pub fn validate_configs(options: &ValidateOptions) -> Result<Vec<String>> {
    let mut messages = Vec::new();

    if let Some(file) = &options.source_file {
        let calendar = load_calendar_file(file)?;
        messages.push(format!("OK: {} ({})", calendar.key(), file.display()));
        return Ok(messages);
    }

    if let Some(dir) = &options.config_dir {
        let calendars = load_calendars_from_dir(dir)?;
        for calendar in calendars {
            messages.push(format!(
                "OK: {} ({})",
                calendar.key(),
                calendar.path.display()
            ));
        }
        return Ok(messages);
    }

    bail!("either --config-dir or --file must be provided");
}

fn select_calendars(config_dir: &std::path::Path, filter: Option<&str>) -> Result<Vec<LoadedCalendar>> {
    let mut calendars = load_calendars_from_dir(config_dir)?;
    if let Some(filter) = filter {
        calendars.retain(|c| c.key() == filter);
    }
    if calendars.is_empty() {
        bail!("no matching calendar configurations found");
    }
    Ok(calendars)
}

fn today_in(calendar: &CalendarConfig) -> Result<NaiveDate> {
    let tz = calendar.timezone()?;
    Ok(Utc::now().with_timezone(&tz).date_naive())
}
