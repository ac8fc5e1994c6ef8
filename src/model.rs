use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Text pieces pulled out of one rendered event element, before any time
/// arithmetic happens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEventFragment {
    pub title_text: String,
    pub time_text: Option<String>,
    pub date_context: Option<NaiveDate>,
    pub source_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventOrigin {
    Scraped,
    RecurringExpansion,
}

/// The normalized unit of truth handed from extraction to reconciliation.
///
/// `start`/`end` keep the source zone's offset for the event's own date, so
/// they compare as instants while still rendering as local wall-clock time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub title: String,
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
    pub all_day: bool,
    pub source_url: Option<String>,
    pub origin: EventOrigin,
    pub pattern_label: Option<String>,
}

impl CanonicalEvent {
    pub fn local_date(&self) -> NaiveDate {
        self.start.date_naive()
    }

    pub fn local_time(&self) -> NaiveTime {
        self.start.time()
    }

    pub fn weekday(&self) -> Weekday {
        self.start.date_naive().weekday()
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn normalized_title(&self) -> String {
        normalize_title(&self.title)
    }
}

/// Case and whitespace insensitive grouping key for titles.
pub fn normalize_title(title: &str) -> String {
    title
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrencePattern {
    pub title: String,
    pub weekdays: BTreeSet<WeekdayKey>,
    pub time_of_day: NaiveTime,
    pub duration_minutes: i64,
    pub confidence_basis: usize,
    pub declared: bool,
}

impl RecurrencePattern {
    pub fn label(&self) -> String {
        let days = self
            .weekdays
            .iter()
            .map(|day| day.short_name())
            .collect::<Vec<_>>()
            .join(", ");
        format!("Every {days} at {}", self.time_of_day.format("%H:%M"))
    }

    pub fn covers(&self, weekday: Weekday) -> bool {
        self.weekdays.contains(&WeekdayKey::from(weekday))
    }
}

/// Orderable wrapper so weekday sets iterate Monday first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WeekdayKey(pub u8);

impl WeekdayKey {
    pub fn weekday(self) -> Weekday {
        match self.0 {
            0 => Weekday::Mon,
            1 => Weekday::Tue,
            2 => Weekday::Wed,
            3 => Weekday::Thu,
            4 => Weekday::Fri,
            5 => Weekday::Sat,
            _ => Weekday::Sun,
        }
    }

    pub fn short_name(self) -> &'static str {
        match self.weekday() {
            Weekday::Mon => "Mon",
            Weekday::Tue => "Tue",
            Weekday::Wed => "Wed",
            Weekday::Thu => "Thu",
            Weekday::Fri => "Fri",
            Weekday::Sat => "Sat",
            Weekday::Sun => "Sun",
        }
    }
}

impl From<Weekday> for WeekdayKey {
    fn from(value: Weekday) -> Self {
        Self(value.num_days_from_monday() as u8)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileAction {
    Create,
    Update,
    Skip,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationRecord {
    pub fingerprint: String,
    pub title: String,
    pub start: DateTime<FixedOffset>,
    pub action: ReconcileAction,
    pub remote_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub records: Vec<ReconciliationRecord>,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl ReconciliationReport {
    pub fn push(&mut self, record: ReconciliationRecord) {
        match record.action {
            ReconcileAction::Create => self.created += 1,
            ReconcileAction::Update => self.updated += 1,
            ReconcileAction::Skip => self.skipped += 1,
            ReconcileAction::Failed => self.failed += 1,
        }
        self.records.push(record);
    }

    pub fn failures(&self) -> impl Iterator<Item = &ReconciliationRecord> {
        self.records
            .iter()
            .filter(|record| record.action == ReconcileAction::Failed)
    }
}

/// Drop and degrade counters accumulated while turning fragments into events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionStats {
    pub fragments_seen: usize,
    pub unresolvable: usize,
    pub date_context_missing: usize,
    pub malformed_time: usize,
}

impl ExtractionStats {
    pub fn absorb(&mut self, other: &ExtractionStats) {
        self.fragments_seen += other.fragments_seen;
        self.unresolvable += other.unresolvable;
        self.date_context_missing += other.date_context_missing;
        self.malformed_time += other.malformed_time;
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CalendarRunReport {
    pub calendar_key: String,
    pub pages_walked: usize,
    pub stats: ExtractionStats,
    pub events_scraped: usize,
    pub duplicates_dropped: usize,
    pub patterns: usize,
    pub synthetic_events: usize,
    pub reconciliation: ReconciliationReport,
    /// Set when the pass stopped before reconciling; other calendars still run.
    pub error: Option<String>,
}

impl CalendarRunReport {
    pub fn failed(calendar_key: &str, error: String) -> Self {
        Self {
            calendar_key: calendar_key.to_string(),
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}
