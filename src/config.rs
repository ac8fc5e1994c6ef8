use crate::model::WeekdayKey;
use anyhow::{Context, Result, anyhow, bail};
use chrono::{NaiveTime, Weekday};
use chrono_tz::Tz;
use reqwest::header::{HeaderName, HeaderValue};
use scraper::Selector;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use url::Url;
use walkdir::WalkDir;

#[derive(Debug, Clone)]
pub struct LoadedCalendar {
    pub path: PathBuf,
    pub config: CalendarConfig,
}

impl LoadedCalendar {
    pub fn key(&self) -> &str {
        &self.config.calendar.key
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CalendarConfig {
    pub calendar: CalendarMeta,
    pub source: SourceConfig,
    #[serde(default)]
    pub extract: ExtractConfig,
    #[serde(default)]
    pub walk: WalkConfig,
    #[serde(default)]
    pub time: TimeConfig,
    #[serde(default)]
    pub recurrence: RecurrenceConfig,
}

impl CalendarConfig {
    pub fn validate(&self) -> Result<()> {
        if self.calendar.key.trim().is_empty() {
            bail!("calendar.key must not be empty");
        }
        if self.calendar.name.trim().is_empty() {
            bail!("calendar.name must not be empty");
        }
        self.timezone()?;

        match self.source.mode {
            SourceMode::Snapshots => {
                if self.source.snapshot_dir.is_none() {
                    bail!("source.snapshot_dir is required for snapshots mode");
                }
            }
            SourceMode::Http => {
                let Some(template) = self.source.url_template.as_deref() else {
                    bail!("source.url_template is required for http mode");
                };
                if !template.contains("{{month}}") {
                    bail!("source.url_template must contain {{{{month}}}}");
                }
                if let Some(start) = self.source.start_month.as_deref() {
                    parse_year_month(start)
                        .ok_or_else(|| anyhow!("source.start_month must be YYYY-MM, got {start}"))?;
                }
            }
        }

        for (field, selector) in [
            ("extract.fragment_selector", &self.extract.fragment_selector),
            ("extract.time_selector", &self.extract.time_selector),
            ("extract.title_selector", &self.extract.title_selector),
        ] {
            Selector::parse(selector)
                .map_err(|err| anyhow!("{field} is not a valid selector {selector}: {err:?}"))?;
        }
        if self.extract.date_attribute.trim().is_empty() {
            bail!("extract.date_attribute must not be empty");
        }
        if let Some(raw) = self.extract.base_url.as_deref() {
            Url::parse(raw).map_err(|err| anyhow!("extract.base_url {raw:?} is not a url: {err}"))?;
        }

        for (name, value) in &self.source.headers {
            HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| anyhow!("source.headers has an invalid header name {name:?}"))?;
            HeaderValue::from_str(value)
                .map_err(|_| anyhow!("source.headers value for {name:?} is not a valid header value"))?;
        }
        if let Some(user_agent) = self.source.user_agent.as_deref() {
            HeaderValue::from_str(user_agent)
                .map_err(|_| anyhow!("source.user_agent is not a valid header value"))?;
        }

        if self.walk.max_months_to_check == 0 {
            bail!("walk.max_months_to_check must be at least 1");
        }
        if self.walk.max_consecutive_empty_months == 0 {
            bail!("walk.max_consecutive_empty_months must be at least 1");
        }
        if self.time.default_duration_minutes <= 0 {
            bail!("time.default_duration_minutes must be positive");
        }
        if self.recurrence.recurrence_horizon_weeks == 0 {
            bail!("recurrence.recurrence_horizon_weeks must be at least 1");
        }

        self.known_patterns()?;
        Ok(())
    }

    pub fn timezone(&self) -> Result<Tz> {
        let name = self.calendar.source_timezone.trim();
        name.parse::<Tz>()
            .map_err(|err| anyhow!("calendar.source_timezone {name:?} is not an IANA zone: {err}"))
    }

    /// The declared title → pattern table, keyed by normalized title.
    pub fn known_patterns(&self) -> Result<KnownPatterns> {
        let mut table = KnownPatterns::default();
        for entry in &self.recurrence.known_recurring_patterns {
            if entry.title.trim().is_empty() {
                bail!("recurrence.known_recurring_patterns entry has an empty title");
            }
            if entry.weekdays.is_empty() {
                bail!("known recurring pattern {:?} has no weekdays", entry.title);
            }
            let weekdays = entry
                .weekdays
                .iter()
                .map(|raw| {
                    raw.trim()
                        .parse::<Weekday>()
                        .map(WeekdayKey::from)
                        .map_err(|_| anyhow!("pattern {:?}: unknown weekday {raw:?}", entry.title))
                })
                .collect::<Result<BTreeSet<_>>>()?;
            let time = NaiveTime::parse_from_str(entry.time.trim(), "%H:%M").map_err(|_| {
                anyhow!("pattern {:?}: time must be HH:MM, got {:?}", entry.title, entry.time)
            })?;
            table.insert(&entry.title, KnownPattern { weekdays, time });
        }
        Ok(table)
    }

    pub fn sanitized_calendar_dir_name(&self) -> String {
        sanitize_for_path(&self.calendar.key)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CalendarMeta {
    pub key: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub location: Option<String>,
    pub source_timezone: String,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    #[default]
    Snapshots,
    Http,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub mode: SourceMode,
    #[serde(default)]
    pub snapshot_dir: Option<PathBuf>,
    #[serde(default = "default_snapshot_glob")]
    pub snapshot_glob: String,
    #[serde(default)]
    pub url_template: Option<String>,
    #[serde(default)]
    pub start_month: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u8,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default)]
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractConfig {
    #[serde(default = "default_fragment_selector")]
    pub fragment_selector: String,
    #[serde(default = "default_time_selector")]
    pub time_selector: String,
    #[serde(default = "default_title_selector")]
    pub title_selector: String,
    #[serde(default = "default_date_attribute")]
    pub date_attribute: String,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            fragment_selector: default_fragment_selector(),
            time_selector: default_time_selector(),
            title_selector: default_title_selector(),
            date_attribute: default_date_attribute(),
            base_url: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct WalkConfig {
    #[serde(default = "default_max_months")]
    pub max_months_to_check: usize,
    #[serde(default = "default_max_empty")]
    pub max_consecutive_empty_months: usize,
}

impl Default for WalkConfig {
    fn default() -> Self {
        Self {
            max_months_to_check: default_max_months(),
            max_consecutive_empty_months: default_max_empty(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TimeConfig {
    #[serde(default = "default_duration_minutes")]
    pub default_duration_minutes: i64,
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            default_duration_minutes: default_duration_minutes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecurrenceConfig {
    #[serde(default = "default_horizon_weeks")]
    pub recurrence_horizon_weeks: u32,
    #[serde(default)]
    pub known_recurring_patterns: Vec<KnownPatternEntry>,
}

impl Default for RecurrenceConfig {
    fn default() -> Self {
        Self {
            recurrence_horizon_weeks: default_horizon_weeks(),
            known_recurring_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct KnownPatternEntry {
    pub title: String,
    pub weekdays: Vec<String>,
    pub time: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownPattern {
    pub weekdays: BTreeSet<WeekdayKey>,
    pub time: NaiveTime,
}

/// Declared recurring titles, matched on the normalized title.
#[derive(Debug, Clone, Default)]
pub struct KnownPatterns {
    by_title: BTreeMap<String, KnownPattern>,
}

impl KnownPatterns {
    pub fn insert(&mut self, title: &str, pattern: KnownPattern) {
        self.by_title
            .insert(crate::model::normalize_title(title), pattern);
    }

    pub fn get(&self, normalized_title: &str) -> Option<&KnownPattern> {
        self.by_title.get(normalized_title)
    }

    pub fn len(&self) -> usize {
        self.by_title.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_title.is_empty()
    }
}

pub fn load_calendars_from_dir(config_dir: &Path) -> Result<Vec<LoadedCalendar>> {
    if !config_dir.exists() {
        bail!("config dir does not exist: {}", config_dir.display());
    }

    let mut loaded = Vec::new();
    for entry in WalkDir::new(config_dir) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("toml") {
            continue;
        }
        loaded.push(load_calendar_file(path)?);
    }

    loaded.sort_by(|a, b| a.config.calendar.key.cmp(&b.config.calendar.key));
    if let Some(pair) = loaded.windows(2).find(|pair| pair[0].key() == pair[1].key()) {
        bail!(
            "duplicate calendar key {} in {} and {}",
            pair[0].key(),
            pair[0].path.display(),
            pair[1].path.display()
        );
    }
    Ok(loaded)
}

pub fn load_calendar_file(config_path: &Path) -> Result<LoadedCalendar> {
    let text = std::fs::read_to_string(config_path)
        .with_context(|| format!("failed to read calendar config: {}", config_path.display()))?;
    let config: CalendarConfig = toml::from_str(&text)
        .with_context(|| format!("failed to parse toml in {}", config_path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid calendar config {}", config_path.display()))?;
    Ok(LoadedCalendar {
        path: config_path.to_path_buf(),
        config,
    })
}

pub fn resolve_path(base_config_path: &Path, maybe_relative: &Path) -> Result<PathBuf> {
    if maybe_relative.is_absolute() {
        return Ok(maybe_relative.to_path_buf());
    }

    let parent = base_config_path.parent().ok_or_else(|| {
        anyhow!(
            "calendar config has no parent directory: {}",
            base_config_path.display()
        )
    })?;

    Ok(parent.join(maybe_relative))
}

pub fn parse_year_month(value: &str) -> Option<(i32, u32)> {
    let (year, month) = value.trim().split_once('-')?;
    let year = year.parse::<i32>().ok()?;
    let month = month.parse::<u32>().ok()?;
    (1..=12).contains(&month).then_some((year, month))
}

pub fn sanitize_for_path(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .trim_matches('-')
        .to_string()
}

fn default_true() -> bool {
    true
}

fn default_snapshot_glob() -> String {
    "*.html".to_string()
}

fn default_timeout_secs() -> u64 {
    20
}

fn default_retry_attempts() -> u8 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_fragment_selector() -> String {
    "a.fc-event".to_string()
}

fn default_time_selector() -> String {
    ".fc-event-time".to_string()
}

fn default_title_selector() -> String {
    ".fc-event-title".to_string()
}

fn default_date_attribute() -> String {
    "data-date".to_string()
}

fn default_max_months() -> usize {
    6
}

fn default_max_empty() -> usize {
    3
}

fn default_duration_minutes() -> i64 {
    60
}

fn default_horizon_weeks() -> u32 {
    12
}
