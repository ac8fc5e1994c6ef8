use anyhow::Result;
use chrono_tz::America::New_York;
use fcsync::config::ExtractConfig;
use fcsync::error::SourceError;
use fcsync::extract::FieldExtractor;
use fcsync::normalize::Normalizer;
use fcsync::walker::{AbortSignal, PageSource, RenderedPage, WalkLimits, WalkState, walk};

/// Pages served from memory; records how far navigation went.
struct MemoryPages {
    pages: Vec<String>,
    cursor: usize,
    served: usize,
    stall_at: Option<usize>,
}

impl MemoryPages {
    fn new(pages: Vec<String>) -> Self {
        Self {
            pages,
            cursor: 0,
            served: 0,
            stall_at: None,
        }
    }
}

impl PageSource for MemoryPages {
    fn current_page(&mut self) -> Result<RenderedPage, SourceError> {
        let html = self.pages.get(self.cursor).cloned().ok_or_else(|| {
            SourceError::NavigationStalled(format!("no page {}", self.cursor))
        })?;
        self.served += 1;
        Ok(RenderedPage {
            label: format!("month-{}", self.cursor),
            url: None,
            html,
        })
    }

    fn advance(&mut self) -> Result<bool, SourceError> {
        if self.stall_at == Some(self.cursor + 1) {
            return Err(SourceError::NavigationStalled("next button missing".to_string()));
        }
        if self.cursor + 1 >= self.pages.len() {
            return Ok(false);
        }
        self.cursor += 1;
        Ok(true)
    }
}

fn busy(date: &str) -> String {
    format!(
        r#"<html><body><table><tr><td data-date="{date}"><a class="fc-event">7p Bible Study</a></td></tr></table></body></html>"#
    )
}

fn empty() -> String {
    r#"<html><body><table><tr><td data-date="2025-12-01"></td></tr></table></body></html>"#
        .to_string()
}

fn tools() -> Result<(FieldExtractor, Normalizer)> {
    Ok((
        FieldExtractor::new(&ExtractConfig::default())?,
        Normalizer::new(New_York, 60),
    ))
}

fn limits(max_pages: usize, max_consecutive_empty: usize) -> WalkLimits {
    WalkLimits {
        max_pages,
        max_consecutive_empty,
    }
}

#[test]
fn stops_after_three_empty_months() -> Result<()> {
    let mut source = MemoryPages::new(vec![
        busy("2025-09-02"),
        empty(),
        empty(),
        empty(),
        busy("2026-01-06"),
    ]);
    let (extractor, normalizer) = tools()?;

    let batches = walk(
        &mut source,
        extractor,
        normalizer,
        limits(6, 3),
        AbortSignal::new(),
    )
    .collect::<Vec<_>>();

    assert_eq!(batches.len(), 4);
    assert_eq!(batches[0].events.len(), 1);
    assert!(batches[1..].iter().all(|b| b.events.is_empty()));
    assert_eq!(source.served, 4);
    assert_eq!(source.cursor, 3);
    Ok(())
}

#[test]
fn empty_streak_resets_on_a_busy_month() -> Result<()> {
    let mut source = MemoryPages::new(vec![
        empty(),
        empty(),
        busy("2025-11-04"),
        empty(),
        empty(),
        busy("2026-02-03"),
    ]);
    let (extractor, normalizer) = tools()?;

    let batches = walk(
        &mut source,
        extractor,
        normalizer,
        limits(10, 3),
        AbortSignal::new(),
    )
    .collect::<Vec<_>>();

    assert_eq!(batches.len(), 6);
    assert_eq!(batches.iter().map(|b| b.events.len()).sum::<usize>(), 2);
    Ok(())
}

#[test]
fn page_cap_bounds_the_walk() -> Result<()> {
    let pages = (1..=9)
        .map(|day| busy(&format!("2025-09-0{day}")))
        .collect::<Vec<_>>();
    let mut source = MemoryPages::new(pages);
    let (extractor, normalizer) = tools()?;

    let mut walker = walk(
        &mut source,
        extractor,
        normalizer,
        limits(2, 3),
        AbortSignal::new(),
    );
    assert!(walker.next().is_some());
    assert!(walker.next().is_some());
    assert!(walker.next().is_none());
    assert_eq!(walker.state(), WalkState::Done);
    assert_eq!(walker.pages_walked(), 2);
    assert!(walker.next().is_none());
    drop(walker);

    assert_eq!(source.served, 2);
    Ok(())
}

#[test]
fn ends_when_navigation_has_nothing_further() -> Result<()> {
    let mut source = MemoryPages::new(vec![busy("2025-09-02"), busy("2025-10-07")]);
    let (extractor, normalizer) = tools()?;

    let count = walk(
        &mut source,
        extractor,
        normalizer,
        limits(6, 3),
        AbortSignal::new(),
    )
    .count();
    assert_eq!(count, 2);
    Ok(())
}

#[test]
fn navigation_failure_ends_walk_with_pages_so_far() -> Result<()> {
    let mut source = MemoryPages::new(vec![
        busy("2025-09-02"),
        busy("2025-10-07"),
        busy("2025-11-04"),
    ]);
    source.stall_at = Some(2);
    let (extractor, normalizer) = tools()?;

    let batches = walk(
        &mut source,
        extractor,
        normalizer,
        limits(6, 3),
        AbortSignal::new(),
    )
    .collect::<Vec<_>>();
    assert_eq!(batches.len(), 2);
    Ok(())
}

#[test]
fn abort_stops_before_next_page() -> Result<()> {
    let mut source = MemoryPages::new(vec![
        busy("2025-09-02"),
        busy("2025-10-07"),
        busy("2025-11-04"),
    ]);
    let (extractor, normalizer) = tools()?;
    let abort = AbortSignal::new();

    let mut walker = walk(&mut source, extractor, normalizer, limits(6, 3), abort.clone());
    let first = walker.next().expect("first page");
    assert_eq!(first.page_index, 0);
    abort.abort();
    assert!(walker.next().is_none());
    assert_eq!(walker.state(), WalkState::Done);
    drop(walker);

    assert_eq!(source.served, 1);
    Ok(())
}

#[test]
fn batches_carry_fragments_and_counters() -> Result<()> {
    let html = concat!(
        "<html><body><table><tr>",
        r#"<td data-date="2025-09-02"><a class="fc-event">6:30a Early Morning Prayer</a><a class="fc-event">sometime Choir</a></td>"#,
        "</tr></table>",
        r#"<a class="fc-event">Floating</a>"#,
        "</body></html>"
    );
    let mut source = MemoryPages::new(vec![html.to_string()]);
    let (extractor, normalizer) = tools()?;

    let batch = walk(
        &mut source,
        extractor,
        normalizer,
        limits(6, 3),
        AbortSignal::new(),
    )
    .next()
    .expect("one page");

    assert_eq!(batch.stats.fragments_seen, 3);
    assert_eq!(batch.stats.date_context_missing, 1);
    assert_eq!(batch.fragments.len(), 2);
    assert_eq!(batch.events.len(), 2);
    assert_eq!(batch.label, "month-0");
    Ok(())
}
