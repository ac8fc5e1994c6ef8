use anyhow::Result;
use chrono::{Datelike, NaiveDate, NaiveTime, Weekday};
use chrono_tz::America::New_York;
use fcsync::config::{KnownPattern, KnownPatterns};
use fcsync::model::{CanonicalEvent, EventOrigin, RawEventFragment, WeekdayKey};
use fcsync::normalize::Normalizer;
use fcsync::recurrence::RecurrenceDetector;
use std::collections::{BTreeSet, HashSet};

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid test date")
}

fn normalizer() -> Normalizer {
    Normalizer::new(New_York, 60)
}

fn scraped(title: &str, time: Option<&str>, day: NaiveDate) -> Result<CanonicalEvent> {
    let (event, _) = normalizer().canonicalize(RawEventFragment {
        title_text: title.to_string(),
        time_text: time.map(str::to_string),
        date_context: Some(day),
        source_url: None,
    })?;
    Ok(event)
}

fn weekdays(days: &[Weekday]) -> BTreeSet<WeekdayKey> {
    days.iter().copied().map(WeekdayKey::from).collect()
}

#[test]
fn declared_pattern_expands_from_single_observation() -> Result<()> {
    let mut known = KnownPatterns::default();
    known.insert(
        "Evening Prayer",
        KnownPattern {
            weekdays: weekdays(&[
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
            ]),
            time: NaiveTime::from_hms_opt(17, 15, 0).expect("valid time"),
        },
    );
    let detector = RecurrenceDetector::new(known, normalizer(), 12);
    let tuesday = scraped("Evening Prayer", Some("5:15p"), date(2025, 9, 2))?;

    let outcome = detector.infer(vec![tuesday], date(2025, 9, 1));

    assert_eq!(outcome.patterns.len(), 1);
    assert!(outcome.patterns[0].declared);
    assert_eq!(outcome.patterns[0].label(), "Every Mon, Tue, Wed, Thu, Fri at 17:15");

    // 12 weeks of weekdays, the scraped Tuesday occupies one slot
    assert_eq!(outcome.synthetic, 59);
    assert_eq!(outcome.events.len(), 60);

    let mut days = HashSet::new();
    for event in &outcome.events {
        assert!(days.insert(event.local_date()), "two instances on {}", event.local_date());
        assert_eq!(event.local_time(), NaiveTime::from_hms_opt(17, 15, 0).expect("valid time"));
        assert!(!matches!(event.weekday(), Weekday::Sat | Weekday::Sun));
    }

    let scraped_count = outcome
        .events
        .iter()
        .filter(|e| e.origin == EventOrigin::Scraped)
        .count();
    assert_eq!(scraped_count, 1);

    let after_dst = outcome
        .events
        .iter()
        .find(|e| e.local_date() == date(2025, 11, 3))
        .expect("instance after fall back");
    assert_eq!(after_dst.start.offset().local_minus_utc(), -5 * 3600);
    assert_eq!(
        after_dst.pattern_label.as_deref(),
        Some("Every Mon, Tue, Wed, Thu, Fri at 17:15")
    );
    Ok(())
}

#[test]
fn same_time_on_two_weekdays_becomes_a_pattern() -> Result<()> {
    let detector = RecurrenceDetector::new(KnownPatterns::default(), normalizer(), 2);
    let events = vec![
        scraped("Bible Study", Some("7p"), date(2025, 9, 1))?,
        scraped("bible  study", Some("7p"), date(2025, 9, 3))?,
    ];

    let patterns = detector.detect(&events);
    assert_eq!(patterns.len(), 1);
    assert!(!patterns[0].declared);
    assert_eq!(patterns[0].weekdays, weekdays(&[Weekday::Mon, Weekday::Wed]));
    assert_eq!(patterns[0].label(), "Every Mon, Wed at 19:00");

    let outcome = detector.infer(events, date(2025, 9, 1));
    let synthetic = outcome
        .events
        .iter()
        .filter(|e| e.origin == EventOrigin::RecurringExpansion)
        .map(|e| e.local_date())
        .collect::<Vec<_>>();
    assert_eq!(synthetic, vec![date(2025, 9, 8), date(2025, 9, 10)]);
    Ok(())
}

#[test]
fn weekly_repeat_of_one_weekday_becomes_a_pattern() -> Result<()> {
    let detector = RecurrenceDetector::new(KnownPatterns::default(), normalizer(), 4);
    let events = vec![
        scraped("Sunday Worship", Some("10:30a"), date(2025, 9, 7))?,
        scraped("Sunday Worship", Some("10:30a"), date(2025, 9, 14))?,
    ];

    let patterns = detector.detect(&events);
    assert_eq!(patterns.len(), 1);
    assert_eq!(patterns[0].weekdays, weekdays(&[Weekday::Sun]));
    assert_eq!(patterns[0].confidence_basis, 2);

    let outcome = detector.infer(events, date(2025, 9, 1));
    let sundays = outcome
        .events
        .iter()
        .map(|e| e.local_date())
        .collect::<Vec<_>>();
    assert_eq!(
        sundays,
        vec![date(2025, 9, 7), date(2025, 9, 14), date(2025, 9, 21), date(2025, 9, 28)]
    );
    assert!(sundays.iter().all(|d| d.weekday() == Weekday::Sun));
    Ok(())
}

#[test]
fn single_observation_stays_one_off() -> Result<()> {
    let detector = RecurrenceDetector::new(KnownPatterns::default(), normalizer(), 12);
    let events = vec![
        scraped("Church Potluck", Some("6p"), date(2025, 9, 12))?,
        scraped("Fall Festival", None, date(2025, 10, 4))?,
        scraped("Fall Festival", None, date(2025, 10, 11))?,
    ];

    let outcome = detector.infer(events, date(2025, 9, 1));
    assert!(outcome.patterns.is_empty());
    assert_eq!(outcome.synthetic, 0);
    assert_eq!(outcome.events.len(), 3);
    Ok(())
}

#[test]
fn different_times_do_not_merge() -> Result<()> {
    let detector = RecurrenceDetector::new(KnownPatterns::default(), normalizer(), 12);
    let events = vec![
        scraped("Choir", Some("6p"), date(2025, 9, 2))?,
        scraped("Choir", Some("7p"), date(2025, 9, 4))?,
    ];
    assert!(detector.detect(&events).is_empty());
    Ok(())
}

#[test]
fn scraped_instance_only_occupies_its_own_time_slot() -> Result<()> {
    let detector = RecurrenceDetector::new(KnownPatterns::default(), normalizer(), 2);
    let events = vec![
        scraped("Mass", Some("9a"), date(2025, 9, 1))?,
        scraped("Mass", Some("9a"), date(2025, 9, 3))?,
        scraped("Mass", Some("6p"), date(2025, 9, 8))?,
        scraped("Mass", Some("6p"), date(2025, 9, 10))?,
    ];

    let outcome = detector.infer(events, date(2025, 9, 1));
    assert_eq!(outcome.patterns.len(), 2);
    assert_eq!(outcome.synthetic, 4);

    let morning = NaiveTime::from_hms_opt(9, 0, 0).expect("valid time");
    let evening = NaiveTime::from_hms_opt(18, 0, 0).expect("valid time");
    let slots = outcome
        .events
        .iter()
        .map(|e| (e.local_date(), e.local_time()))
        .collect::<HashSet<_>>();
    assert_eq!(slots.len(), 8);
    for day in [date(2025, 9, 1), date(2025, 9, 3), date(2025, 9, 8), date(2025, 9, 10)] {
        assert!(slots.contains(&(day, morning)), "missing morning on {day}");
        assert!(slots.contains(&(day, evening)), "missing evening on {day}");
    }
    Ok(())
}
