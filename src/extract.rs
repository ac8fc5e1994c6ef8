use crate::config::ExtractConfig;
use crate::error::ExtractError;
use crate::model::RawEventFragment;
use anyhow::{Result, anyhow};
use chrono::NaiveDate;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::sync::LazyLock;
use tracing::{debug, warn};
use url::Url;

const CLOCK_TOKEN: &str = r"\d{1,2}:\d{2}(?:\s?[ap]\.?m\.?|[ap])?|\d{1,2}[ap]m?";

static LEADING_TIME: LazyLock<Regex> = LazyLock::new(|| {
    let pattern = format!(
        r"(?is)^\s*((?:{CLOCK_TOKEN})(?:\s*[-\u{{2013}}]\s*(?:{CLOCK_TOKEN}))?)(?:\s+(.*?))?\s*$"
    );
    Regex::new(&pattern).expect("leading time regex must compile")
});

static ARIA_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([A-Za-z]+)\s+(\d{1,2}),?\s+(\d{4})").expect("aria date regex must compile")
});

/// Title and optional time text recovered by one extraction tier.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TitleAndTime {
    title: String,
    time: Option<String>,
}

type Tier = fn(&FieldExtractor, ElementRef<'_>) -> Option<TitleAndTime>;

/// Ordered fallbacks; the first tier returning a title wins.
const TIERS: [(&str, Tier); 4] = [
    ("structured", FieldExtractor::structured_tier),
    ("partial", FieldExtractor::partial_tier),
    ("text_split", FieldExtractor::text_split_tier),
    ("whole_text", FieldExtractor::whole_text_tier),
];

/// Outcome of running the extractor over one rendered page.
#[derive(Debug, Clone, Default)]
pub struct PageExtraction {
    pub fragments: Vec<RawEventFragment>,
    pub fragments_seen: usize,
    pub unresolvable: usize,
    pub date_context_missing: usize,
}

#[derive(Debug, Clone)]
pub struct FieldExtractor {
    fragment: Selector,
    time: Selector,
    title: Selector,
    date_attribute: String,
    base_url: Option<Url>,
}

impl FieldExtractor {
    pub fn new(config: &ExtractConfig) -> Result<Self> {
        let base_url = match config.base_url.as_deref() {
            Some(raw) => Some(Url::parse(raw).map_err(|err| anyhow!("invalid base_url {raw}: {err}"))?),
            None => None,
        };
        Ok(Self {
            fragment: parse_selector(&config.fragment_selector)?,
            time: parse_selector(&config.time_selector)?,
            title: parse_selector(&config.title_selector)?,
            date_attribute: config.date_attribute.clone(),
            base_url,
        })
    }

    /// Same extractor resolving relative links against a specific page URL
    /// when no base URL was configured.
    pub fn with_page_url(&self, page_url: Option<&str>) -> Self {
        let mut clone = self.clone();
        if clone.base_url.is_none() {
            clone.base_url = page_url.and_then(|raw| Url::parse(raw).ok());
        }
        clone
    }

    pub fn fragments<'a>(&self, page: &'a Html) -> Vec<ElementRef<'a>> {
        page.select(&self.fragment).collect()
    }

    pub fn extract_page(&self, page: &Html) -> PageExtraction {
        let mut out = PageExtraction::default();
        for element in self.fragments(page) {
            out.fragments_seen += 1;
            match self.extract(element) {
                Ok(fragment) => out.fragments.push(fragment),
                Err(ExtractError::FragmentUnresolvable) => {
                    debug!(html = %element.html(), "dropping fragment without usable title");
                    out.unresolvable += 1;
                }
                Err(err @ ExtractError::DateContextMissing { .. }) => {
                    warn!(error = %err, "dropping fragment");
                    out.date_context_missing += 1;
                }
            }
        }
        out
    }

    pub fn extract(&self, fragment: ElementRef<'_>) -> Result<RawEventFragment, ExtractError> {
        let fields = TIERS
            .iter()
            .find_map(|(name, tier)| {
                tier(self, fragment).inspect(|found| {
                    debug!(tier = name, title = %found.title, "fragment fields extracted");
                })
            })
            .ok_or(ExtractError::FragmentUnresolvable)?;

        let date_context = self
            .resolve_date_context(fragment)
            .ok_or_else(|| ExtractError::DateContextMissing {
                title: fields.title.clone(),
            })?;

        let source_url = fragment
            .value()
            .attr("href")
            .map(str::trim)
            .filter(|href| !href.is_empty() && !href.starts_with('#'))
            .map(|href| absolutize_url(self.base_url.as_ref(), href));

        Ok(RawEventFragment {
            title_text: fields.title,
            time_text: fields.time,
            date_context: Some(date_context),
            source_url,
        })
    }

    fn structured_tier(&self, fragment: ElementRef<'_>) -> Option<TitleAndTime> {
        let time = first_text(fragment, &self.time)?;
        let title = first_text(fragment, &self.title)?;
        Some(TitleAndTime {
            title,
            time: Some(time),
        })
    }

    fn partial_tier(&self, fragment: ElementRef<'_>) -> Option<TitleAndTime> {
        let full = element_text(fragment);
        match (first_text(fragment, &self.time), first_text(fragment, &self.title)) {
            (Some(_), Some(_)) | (None, None) => None,
            (None, Some(title)) => Some(TitleAndTime {
                time: split_leading_time(&full).map(|(time, _)| time),
                title,
            }),
            (Some(time), None) => {
                let title = full.replacen(&time, "", 1).trim().to_string();
                (!title.is_empty()).then_some(TitleAndTime {
                    title,
                    time: Some(time),
                })
            }
        }
    }

    fn text_split_tier(&self, fragment: ElementRef<'_>) -> Option<TitleAndTime> {
        let (time, title) = split_leading_time(&element_text(fragment))?;
        Some(TitleAndTime {
            title: title?,
            time: Some(time),
        })
    }

    fn whole_text_tier(&self, fragment: ElementRef<'_>) -> Option<TitleAndTime> {
        let full = element_text(fragment);
        if full.is_empty() || split_leading_time(&full).is_some() {
            return None;
        }
        Some(TitleAndTime {
            title: full,
            time: None,
        })
    }

    /// Walks outward from the fragment; the nearest day cell carrying a date
    /// wins. Never guesses a date.
    fn resolve_date_context(&self, fragment: ElementRef<'_>) -> Option<NaiveDate> {
        fragment
            .ancestors()
            .filter_map(ElementRef::wrap)
            .find_map(|ancestor| {
                let element = ancestor.value();
                if let Some(date) = element
                    .attr(&self.date_attribute)
                    .and_then(parse_iso_date)
                {
                    return Some(date);
                }
                if is_day_cell(ancestor) {
                    return element.attr("aria-label").and_then(parse_label_date);
                }
                None
            })
    }
}

/// Splits `"6:30a Early Morning Prayer"` into its leading clock token and the
/// remaining title, if any.
pub fn split_leading_time(text: &str) -> Option<(String, Option<String>)> {
    let caps = LEADING_TIME.captures(text)?;
    let time = caps.get(1)?.as_str().trim().to_string();
    let title = caps
        .get(2)
        .map(|m| m.as_str().trim().to_string())
        .filter(|t| !t.is_empty());
    Some((time, title))
}

fn parse_selector(raw: &str) -> Result<Selector> {
    Selector::parse(raw).map_err(|err| anyhow!("invalid selector {raw}: {err:?}"))
}

fn first_text(node: ElementRef<'_>, selector: &Selector) -> Option<String> {
    node.select(selector)
        .next()
        .map(element_text)
        .filter(|text| !text.is_empty())
}

fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_day_cell(element: ElementRef<'_>) -> bool {
    let value = element.value();
    value.name() == "td" || value.classes().any(|class| class.starts_with("fc-day"))
}

fn parse_iso_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    let head = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

fn parse_label_date(label: &str) -> Option<NaiveDate> {
    let caps = ARIA_DATE.captures(label)?;
    let text = format!(
        "{} {} {}",
        caps.get(1)?.as_str(),
        caps.get(2)?.as_str(),
        caps.get(3)?.as_str()
    );
    NaiveDate::parse_from_str(&text, "%B %d %Y")
        .or_else(|_| NaiveDate::parse_from_str(&text, "%b %d %Y"))
        .ok()
}

fn absolutize_url(base_url: Option<&Url>, value: &str) -> String {
    if value.starts_with("http://") || value.starts_with("https://") {
        return value.to_string();
    }

    if let Some(base) = base_url
        && let Ok(joined) = base.join(value)
    {
        return joined.to_string();
    }

    value.to_string()
}
