use crate::config::CalendarConfig;
use crate::model::{CanonicalEvent, EventOrigin};
use crate::reconcile::fingerprint;
use anyhow::{Context, Result};
use chrono::{Datelike, Duration, Timelike, Utc};
use std::path::Path;

pub fn write_calendar_preview(
    calendar: &CalendarConfig,
    events: &[CanonicalEvent],
    path: &Path,
) -> Result<()> {
    let stamp = Utc::now();
    let mut lines = Vec::new();
    push_line(&mut lines, "BEGIN:VCALENDAR".to_string());
    push_line(&mut lines, "VERSION:2.0".to_string());
    push_line(
        &mut lines,
        "PRODID:-//fcsync//Calendar Preview 1.0//EN".to_string(),
    );
    push_line(&mut lines, "CALSCALE:GREGORIAN".to_string());
    push_line(&mut lines, "METHOD:PUBLISH".to_string());
    push_line(
        &mut lines,
        format!("X-WR-CALNAME:{}", escape_text(&calendar.calendar.name)),
    );
    push_line(
        &mut lines,
        format!(
            "X-WR-TIMEZONE:{}",
            escape_text(&calendar.calendar.source_timezone)
        ),
    );

    for event in events {
        append_event_lines(&mut lines, calendar, event, stamp);
    }

    push_line(&mut lines, "END:VCALENDAR".to_string());

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create output dir {}", parent.display()))?;
    }

    std::fs::write(path, lines.join("\r\n") + "\r\n")
        .with_context(|| format!("failed to write ics {}", path.display()))?;

    Ok(())
}

fn append_event_lines(
    lines: &mut Vec<String>,
    calendar: &CalendarConfig,
    event: &CanonicalEvent,
    stamp: chrono::DateTime<Utc>,
) {
    push_line(lines, "BEGIN:VEVENT".to_string());
    push_line(lines, format!("UID:{}@fcsync.local", fingerprint(event)));
    push_line(lines, format!("DTSTAMP:{}", format_utc(stamp)));

    if event.all_day {
        let date = event.local_date();
        push_line(lines, format!("DTSTART;VALUE=DATE:{}", format_date(date)));
        let exclusive_end = date + Duration::days(1);
        push_line(lines, format!("DTEND;VALUE=DATE:{}", format_date(exclusive_end)));
    } else {
        push_line(
            lines,
            format!("DTSTART:{}", format_utc(event.start.with_timezone(&Utc))),
        );
        push_line(
            lines,
            format!("DTEND:{}", format_utc(event.end.with_timezone(&Utc))),
        );
    }

    push_line(lines, format!("SUMMARY:{}", escape_text(&event.title)));

    if let Some(label) = &event.pattern_label {
        push_line(
            lines,
            format!("DESCRIPTION:{}", escape_text(&format!("Recurring: {label}"))),
        );
    }
    if let Some(location) = &calendar.calendar.location {
        push_line(lines, format!("LOCATION:{}", escape_text(location)));
    }
    if let Some(url) = &event.source_url {
        push_line(lines, format!("URL:{}", escape_text(url)));
    }

    push_line(lines, "STATUS:CONFIRMED".to_string());
    push_line(lines, "TRANSP:OPAQUE".to_string());
    push_line(
        lines,
        format!(
            "X-FCSYNC-CALENDAR-KEY:{}",
            escape_text(&calendar.calendar.key)
        ),
    );
    let origin = match event.origin {
        EventOrigin::Scraped => "SCRAPED",
        EventOrigin::RecurringExpansion => "RECURRING-EXPANSION",
    };
    push_line(lines, format!("X-FCSYNC-ORIGIN:{origin}"));

    push_line(lines, "END:VEVENT".to_string());
}

fn push_line(lines: &mut Vec<String>, line: String) {
    for folded in fold_line(&line) {
        lines.push(folded);
    }
}

fn fold_line(line: &str) -> Vec<String> {
    const LIMIT: usize = 75;

    if line.len() <= LIMIT {
        return vec![line.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();

    for ch in line.chars() {
        // continuation lines carry a leading space, which counts toward the limit
        let budget = if chunks.is_empty() { LIMIT } else { LIMIT - 1 };
        if current.len() + ch.len_utf8() > budget {
            if chunks.is_empty() {
                chunks.push(current.clone());
            } else {
                chunks.push(format!(" {current}"));
            }
            current.clear();
        }
        current.push(ch);
    }

    if !current.is_empty() {
        if chunks.is_empty() {
            chunks.push(current);
        } else {
            chunks.push(format!(" {current}"));
        }
    }

    chunks
}

fn format_utc(value: chrono::DateTime<Utc>) -> String {
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        value.year(),
        value.month(),
        value.day(),
        value.hour(),
        value.minute(),
        value.second()
    )
}

fn format_date(value: chrono::NaiveDate) -> String {
    format!("{:04}{:02}{:02}", value.year(), value.month(), value.day())
}

fn escape_text(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace(';', "\\;")
        .replace(',', "\\,")
        .replace('\n', "\\n")
}
