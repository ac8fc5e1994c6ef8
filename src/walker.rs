use crate::config::WalkConfig;
use crate::error::SourceError;
use crate::extract::FieldExtractor;
use crate::model::{CanonicalEvent, ExtractionStats, RawEventFragment};
use crate::normalize::Normalizer;
use scraper::Html;
use std::iter::FusedIterator;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// One rendered month page as handed over by the navigation collaborator.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub label: String,
    pub url: Option<String>,
    pub html: String,
}

/// Navigation collaborator. Turning the page is its business; the walker
/// only decides when to stop asking.
pub trait PageSource {
    fn current_page(&mut self) -> Result<RenderedPage, SourceError>;

    /// Moves to the next month. `Ok(false)` means there is nothing further.
    fn advance(&mut self) -> Result<bool, SourceError>;
}

impl<S: PageSource + ?Sized> PageSource for &mut S {
    fn current_page(&mut self) -> Result<RenderedPage, SourceError> {
        (**self).current_page()
    }

    fn advance(&mut self) -> Result<bool, SourceError> {
        (**self).advance()
    }
}

impl<S: PageSource + ?Sized> PageSource for Box<S> {
    fn current_page(&mut self) -> Result<RenderedPage, SourceError> {
        (**self).current_page()
    }

    fn advance(&mut self) -> Result<bool, SourceError> {
        (**self).advance()
    }
}

/// Cooperative cancellation flag, checked between pages.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkLimits {
    pub max_pages: usize,
    pub max_consecutive_empty: usize,
}

impl Default for WalkLimits {
    fn default() -> Self {
        WalkConfig::default().into()
    }
}

impl From<WalkConfig> for WalkLimits {
    fn from(config: WalkConfig) -> Self {
        Self {
            max_pages: config.max_months_to_check,
            max_consecutive_empty: config.max_consecutive_empty_months,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkState {
    Scanning,
    EmptyStreak(usize),
    Done,
}

#[derive(Debug, Clone)]
pub struct PageBatch {
    pub page_index: usize,
    pub label: String,
    pub fragments: Vec<RawEventFragment>,
    pub events: Vec<CanonicalEvent>,
    pub stats: ExtractionStats,
}

/// Lazy, forward-only sequence of per-page batches. Consumes its source, so
/// a walk cannot be restarted.
pub struct MonthWalker<S> {
    source: S,
    extractor: FieldExtractor,
    normalizer: Normalizer,
    limits: WalkLimits,
    abort: AbortSignal,
    state: WalkState,
    pages_walked: usize,
    needs_advance: bool,
}

pub fn walk<S: PageSource>(
    source: S,
    extractor: FieldExtractor,
    normalizer: Normalizer,
    limits: WalkLimits,
    abort: AbortSignal,
) -> MonthWalker<S> {
    MonthWalker {
        source,
        extractor,
        normalizer,
        limits,
        abort,
        state: WalkState::Scanning,
        pages_walked: 0,
        needs_advance: false,
    }
}

impl<S: PageSource> MonthWalker<S> {
    pub fn state(&self) -> WalkState {
        self.state
    }

    pub fn pages_walked(&self) -> usize {
        self.pages_walked
    }

    fn finish(&mut self) -> Option<PageBatch> {
        self.state = WalkState::Done;
        None
    }

    fn process(&self, page: RenderedPage) -> PageBatch {
        let document = Html::parse_document(&page.html);
        let extraction = self
            .extractor
            .with_page_url(page.url.as_deref())
            .extract_page(&document);

        let mut stats = ExtractionStats {
            fragments_seen: extraction.fragments_seen,
            unresolvable: extraction.unresolvable,
            date_context_missing: extraction.date_context_missing,
            malformed_time: 0,
        };

        let mut events = Vec::with_capacity(extraction.fragments.len());
        for fragment in &extraction.fragments {
            match self.normalizer.canonicalize(fragment.clone()) {
                Ok((event, degraded)) => {
                    if degraded {
                        stats.malformed_time += 1;
                    }
                    events.push(event);
                }
                Err(err) => {
                    debug!(page = %page.label, error = %err, "fragment dropped during normalization");
                    stats.unresolvable += 1;
                }
            }
        }

        PageBatch {
            page_index: self.pages_walked,
            label: page.label,
            fragments: extraction.fragments,
            events,
            stats,
        }
    }
}

impl<S: PageSource> Iterator for MonthWalker<S> {
    type Item = PageBatch;

    fn next(&mut self) -> Option<PageBatch> {
        if self.state == WalkState::Done {
            return None;
        }
        if self.abort.is_aborted() {
            info!(pages = self.pages_walked, "walk aborted");
            return self.finish();
        }

        if self.needs_advance {
            match self.source.advance() {
                Ok(true) => {}
                Ok(false) => {
                    info!(pages = self.pages_walked, "no further page; walk complete");
                    return self.finish();
                }
                Err(err) => {
                    warn!(pages = self.pages_walked, error = %err, "navigation stalled; walk complete");
                    return self.finish();
                }
            }
        }

        let page = match self.source.current_page() {
            Ok(page) => page,
            Err(err) => {
                warn!(pages = self.pages_walked, error = %err, "page unavailable; walk complete");
                return self.finish();
            }
        };

        let batch = self.process(page);
        self.pages_walked += 1;
        self.needs_advance = true;

        let streak = match (self.state, batch.events.is_empty()) {
            (_, false) => 0,
            (WalkState::EmptyStreak(n), true) => n + 1,
            (_, true) => 1,
        };

        info!(
            page = %batch.label,
            index = batch.page_index,
            fragments = batch.stats.fragments_seen,
            events = batch.events.len(),
            empty_streak = streak,
            "page scanned"
        );

        self.state = if streak >= self.limits.max_consecutive_empty
            || self.pages_walked >= self.limits.max_pages
        {
            WalkState::Done
        } else if streak > 0 {
            WalkState::EmptyStreak(streak)
        } else {
            WalkState::Scanning
        };

        Some(batch)
    }
}

impl<S: PageSource> FusedIterator for MonthWalker<S> {}
