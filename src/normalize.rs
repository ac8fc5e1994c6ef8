use crate::error::{ExtractError, NormalizeError};
use crate::model::{CanonicalEvent, EventOrigin, RawEventFragment};
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use chrono_tz::Tz;
use regex::Regex;
use std::sync::LazyLock;
use tracing::warn;

static TWELVE_HOUR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(\d{1,2})(?::(\d{2}))?\s*([ap])\.?(?:m\.?)?$")
        .expect("twelve hour regex must compile")
});

static TWENTY_FOUR_HOUR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{1,2}):(\d{2})$").expect("twenty four hour regex must compile")
});

static RANGE_SEPARATOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\s*[-\u{2013}\u{2014}]\s*|\s+to\s+").expect("range separator regex must compile")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizedTime {
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
    pub all_day: bool,
}

impl NormalizedTime {
    /// Wall-clock text that normalizes back to the same instant.
    pub fn canonical_time_text(&self) -> Option<String> {
        if self.all_day {
            return None;
        }
        Some(format!(
            "{}-{}",
            self.start.format("%H:%M"),
            self.end.format("%H:%M")
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Meridiem {
    Am,
    Pm,
}

#[derive(Debug, Clone, Copy)]
struct ClockToken {
    hour: u32,
    minute: u32,
    meridiem: Option<Meridiem>,
}

impl ClockToken {
    fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if let Some(caps) = TWELVE_HOUR.captures(text) {
            let hour = caps.get(1)?.as_str().parse().ok()?;
            let minute = caps.get(2).map_or(Some(0), |m| m.as_str().parse().ok())?;
            let meridiem = match caps.get(3)?.as_str() {
                "a" | "A" => Meridiem::Am,
                _ => Meridiem::Pm,
            };
            return Some(Self {
                hour,
                minute,
                meridiem: Some(meridiem),
            });
        }
        if let Some(caps) = TWENTY_FOUR_HOUR.captures(text) {
            return Some(Self {
                hour: caps.get(1)?.as_str().parse().ok()?,
                minute: caps.get(2)?.as_str().parse().ok()?,
                meridiem: None,
            });
        }
        None
    }

    fn to_time(self) -> Option<NaiveTime> {
        let hour = match self.meridiem {
            Some(_) if !(1..=12).contains(&self.hour) => return None,
            Some(Meridiem::Am) => self.hour % 12,
            Some(Meridiem::Pm) => self.hour % 12 + 12,
            None => self.hour,
        };
        NaiveTime::from_hms_opt(hour, self.minute, 0)
    }
}

/// Parses `6:30a`, `5:15p`, `7p`, `18:45` and ranges such as `6:30a - 8a`.
/// Returns the start time and the explicit end time when one is present.
pub fn parse_time_text(text: &str) -> Result<(NaiveTime, Option<NaiveTime>), NormalizeError> {
    let malformed = || NormalizeError::MalformedTime(text.to_string());
    let trimmed = text.trim();

    let parts = RANGE_SEPARATOR.splitn(trimmed, 2).collect::<Vec<_>>();
    match parts.as_slice() {
        [single] => {
            let start = ClockToken::parse(single)
                .and_then(ClockToken::to_time)
                .ok_or_else(malformed)?;
            Ok((start, None))
        }
        [first, second] => {
            let mut start = ClockToken::parse(first).ok_or_else(malformed)?;
            let end = ClockToken::parse(second).ok_or_else(malformed)?;
            // "6:30 - 8:00p" shares the trailing meridiem.
            if start.meridiem.is_none() && end.meridiem.is_some() && start.hour <= 12 {
                start.meridiem = end.meridiem;
            }
            let start = start.to_time().ok_or_else(malformed)?;
            let end = end.to_time().ok_or_else(malformed)?;
            Ok((start, Some(end)))
        }
        _ => Err(malformed()),
    }
}

/// Converts wall-clock text in the source organization's zone into absolute
/// instants. One instance per calendar pass.
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    timezone: Tz,
    default_duration: Duration,
}

impl Normalizer {
    pub fn new(timezone: Tz, default_duration_minutes: i64) -> Self {
        Self {
            timezone,
            default_duration: Duration::minutes(default_duration_minutes.max(1)),
        }
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn default_duration(&self) -> Duration {
        self.default_duration
    }

    pub fn normalize(
        &self,
        time_text: Option<&str>,
        date: NaiveDate,
    ) -> Result<NormalizedTime, NormalizeError> {
        let Some(text) = time_text.map(str::trim).filter(|t| !t.is_empty()) else {
            return Ok(self.all_day(date));
        };

        let (start_time, end_time) = parse_time_text(text)?;
        let start_naive = date.and_time(start_time);
        let Some(end) = end_time else {
            return Ok(self.at(date, start_time, self.default_duration));
        };

        let mut end_naive = date.and_time(end);
        if end_naive <= start_naive {
            end_naive += Duration::days(1);
        }
        let start = self.localize(start_naive);
        let mut end = self.localize(end_naive);
        // a start pushed past a spring-forward gap can land on the end
        if end <= start {
            end = self.shift(start, end_naive - start_naive);
        }

        Ok(NormalizedTime {
            start,
            end,
            all_day: false,
        })
    }

    pub fn all_day(&self, date: NaiveDate) -> NormalizedTime {
        let start = date.and_time(NaiveTime::MIN);
        let end = date.and_time(NaiveTime::from_hms_opt(23, 59, 0).unwrap_or(NaiveTime::MIN));
        NormalizedTime {
            start: self.localize(start),
            end: self.localize(end),
            all_day: true,
        }
    }

    /// Timed event whose end is `duration` after the resolved start instant.
    pub fn at(&self, date: NaiveDate, time: NaiveTime, duration: Duration) -> NormalizedTime {
        let start = self.localize(date.and_time(time));
        NormalizedTime {
            start,
            end: self.shift(start, duration),
            all_day: false,
        }
    }

    /// Instant arithmetic, re-expressed with the zone's offset at the result.
    fn shift(&self, instant: DateTime<FixedOffset>, by: Duration) -> DateTime<FixedOffset> {
        (instant + by.max(Duration::minutes(1)))
            .with_timezone(&self.timezone)
            .fixed_offset()
    }

    /// Resolves a local wall-clock time using the zone's offset on that date.
    /// Ambiguous (fall-back) times take the earlier instant; times inside a
    /// spring-forward gap are pushed past the gap.
    pub fn localize(&self, naive: NaiveDateTime) -> DateTime<FixedOffset> {
        let resolved = self
            .timezone
            .from_local_datetime(&naive)
            .earliest()
            .or_else(|| {
                self.timezone
                    .from_local_datetime(&(naive + Duration::hours(1)))
                    .earliest()
            });

        match resolved {
            Some(dt) => dt.fixed_offset(),
            None => self.timezone.from_utc_datetime(&naive).fixed_offset(),
        }
    }

    /// Turns one raw fragment into a scraped event. A malformed time degrades
    /// to an all-day event; the returned flag reports that degradation.
    pub fn canonicalize(
        &self,
        fragment: RawEventFragment,
    ) -> Result<(CanonicalEvent, bool), ExtractError> {
        let title = fragment.title_text.trim().to_string();
        if title.is_empty() {
            return Err(ExtractError::FragmentUnresolvable);
        }
        let Some(date) = fragment.date_context else {
            return Err(ExtractError::DateContextMissing { title });
        };

        let (normalized, degraded) = match self.normalize(fragment.time_text.as_deref(), date) {
            Ok(normalized) => (normalized, false),
            Err(err) => {
                warn!(title = %title, %date, error = %err, "treating event as all-day");
                (self.all_day(date), true)
            }
        };

        Ok((
            CanonicalEvent {
                title,
                start: normalized.start,
                end: normalized.end,
                all_day: normalized.all_day,
                source_url: fragment.source_url,
                origin: EventOrigin::Scraped,
                pattern_label: None,
            },
            degraded,
        ))
    }
}
