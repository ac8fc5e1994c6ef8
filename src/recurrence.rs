use crate::config::KnownPatterns;
use crate::model::{CanonicalEvent, EventOrigin, RecurrencePattern, WeekdayKey, normalize_title};
use crate::normalize::Normalizer;
use chrono::{Datelike, Duration, IsoWeek, NaiveDate, NaiveTime};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, info};

#[derive(Debug, Clone, Default)]
pub struct RecurrenceOutcome {
    pub patterns: Vec<RecurrencePattern>,
    /// Scraped events followed by synthesized ones, ordered by start.
    pub events: Vec<CanonicalEvent>,
    pub synthetic: usize,
}

/// Infers weekly patterns from one walk's worth of scraped events and
/// expands them over a fixed horizon.
#[derive(Debug, Clone)]
pub struct RecurrenceDetector {
    known: KnownPatterns,
    normalizer: Normalizer,
    horizon_weeks: u32,
}

#[derive(Default)]
struct TimeEvidence {
    weekdays: BTreeSet<WeekdayKey>,
    weeks: BTreeSet<IsoWeek>,
    duration: Option<Duration>,
}

impl RecurrenceDetector {
    pub fn new(known: KnownPatterns, normalizer: Normalizer, horizon_weeks: u32) -> Self {
        Self {
            known,
            normalizer,
            horizon_weeks,
        }
    }

    pub fn detect(&self, events: &[CanonicalEvent]) -> Vec<RecurrencePattern> {
        let mut groups: BTreeMap<String, Vec<&CanonicalEvent>> = BTreeMap::new();
        for event in events.iter().filter(|e| e.origin == EventOrigin::Scraped) {
            groups.entry(event.normalized_title()).or_default().push(event);
        }

        let mut patterns = Vec::new();
        for (key, group) in groups {
            let title = group[0].title.clone();

            if let Some(declared) = self.known.get(&key) {
                let supporting = group
                    .iter()
                    .filter(|e| {
                        !e.all_day
                            && e.local_time() == declared.time
                            && declared.weekdays.contains(&WeekdayKey::from(e.weekday()))
                    })
                    .collect::<Vec<_>>();
                let duration = supporting
                    .first()
                    .map(|e| e.duration())
                    .unwrap_or_else(|| self.normalizer.default_duration());
                let weeks = supporting
                    .iter()
                    .map(|e| e.local_date().iso_week())
                    .collect::<BTreeSet<_>>();

                info!(title = %title, observed = group.len(), "declared recurring pattern applied");
                patterns.push(RecurrencePattern {
                    title,
                    weekdays: declared.weekdays.clone(),
                    time_of_day: declared.time,
                    duration_minutes: duration.num_minutes(),
                    confidence_basis: weeks.len(),
                    declared: true,
                });
                continue;
            }

            let mut by_time: BTreeMap<NaiveTime, TimeEvidence> = BTreeMap::new();
            for event in group.iter().filter(|e| !e.all_day) {
                let evidence = by_time.entry(event.local_time()).or_default();
                evidence.weekdays.insert(WeekdayKey::from(event.weekday()));
                evidence.weeks.insert(event.local_date().iso_week());
                evidence.duration.get_or_insert(event.duration());
            }

            for (time_of_day, evidence) in by_time {
                let spans_weekdays = evidence.weekdays.len() >= 2;
                let repeats_weekly = evidence.weeks.len() >= 2;
                if !spans_weekdays && !repeats_weekly {
                    debug!(title = %title, time = %time_of_day, "single observation kept as one-off");
                    continue;
                }

                let duration = evidence
                    .duration
                    .unwrap_or_else(|| self.normalizer.default_duration());
                let pattern = RecurrencePattern {
                    title: title.clone(),
                    weekdays: evidence.weekdays,
                    time_of_day,
                    duration_minutes: duration.num_minutes(),
                    confidence_basis: evidence.weeks.len(),
                    declared: false,
                };
                info!(
                    title = %title,
                    pattern = %pattern.label(),
                    weeks = pattern.confidence_basis,
                    "weekly pattern inferred"
                );
                patterns.push(pattern);
            }
        }

        patterns
    }

    /// One synthetic event per covered weekday in `[today, today + horizon)`.
    /// A slot already holding a scraped instance of the same title at the
    /// same wall-clock time is left to that instance.
    pub fn expand(
        &self,
        patterns: &[RecurrencePattern],
        scraped: &[CanonicalEvent],
        today: NaiveDate,
    ) -> Vec<CanonicalEvent> {
        let occupied = scraped
            .iter()
            .filter(|e| e.origin == EventOrigin::Scraped && !e.all_day)
            .map(|e| (e.normalized_title(), e.local_date(), e.local_time()))
            .collect::<HashSet<_>>();

        let horizon_days = i64::from(self.horizon_weeks) * 7;
        let mut emitted = HashSet::new();
        let mut out = Vec::new();

        for pattern in patterns {
            let key = normalize_title(&pattern.title);
            let label = pattern.label();
            let duration = Duration::minutes(pattern.duration_minutes.max(1));

            for offset in 0..horizon_days {
                let Some(date) = today.checked_add_signed(Duration::days(offset)) else {
                    break;
                };
                if !pattern.covers(date.weekday()) {
                    continue;
                }
                let slot = (key.clone(), date, pattern.time_of_day);
                if occupied.contains(&slot) || !emitted.insert(slot) {
                    continue;
                }

                let time = self.normalizer.at(date, pattern.time_of_day, duration);
                out.push(CanonicalEvent {
                    title: pattern.title.clone(),
                    start: time.start,
                    end: time.end,
                    all_day: false,
                    source_url: None,
                    origin: EventOrigin::RecurringExpansion,
                    pattern_label: Some(label.clone()),
                });
            }
        }

        out
    }

    pub fn infer(&self, scraped: Vec<CanonicalEvent>, today: NaiveDate) -> RecurrenceOutcome {
        let patterns = self.detect(&scraped);
        let synthetic = self.expand(&patterns, &scraped, today);
        let synthetic_count = synthetic.len();

        let mut events = scraped;
        events.extend(synthetic);
        events.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.title.cmp(&b.title)));

        info!(
            patterns = patterns.len(),
            synthetic = synthetic_count,
            total = events.len(),
            "recurrence expansion complete"
        );

        RecurrenceOutcome {
            patterns,
            events,
            synthetic: synthetic_count,
        }
    }
}
