use crate::config::{LoadedCalendar, SourceMode, parse_year_month, resolve_path};
use crate::error::SourceError;
use crate::walker::{PageSource, RenderedPage};
use anyhow::{Context, Result, anyhow, bail};
use chrono::{Datelike, NaiveDate, Utc};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Builds the page source a calendar's configuration asks for.
pub fn open_page_source(calendar: &LoadedCalendar) -> Result<Box<dyn PageSource>> {
    match calendar.config.source.mode {
        SourceMode::Snapshots => Ok(Box::new(SnapshotPages::from_calendar(calendar)?)),
        SourceMode::Http => Ok(Box::new(HttpMonthPages::from_calendar(calendar)?)),
    }
}

/// Month pages rendered ahead of time and saved as HTML files; file name order
/// is page order.
#[derive(Debug, Clone)]
pub struct SnapshotPages {
    files: Vec<PathBuf>,
    cursor: usize,
}

impl SnapshotPages {
    pub fn new(files: Vec<PathBuf>) -> Self {
        Self { files, cursor: 0 }
    }

    pub fn from_calendar(calendar: &LoadedCalendar) -> Result<Self> {
        let dir = calendar
            .config
            .source
            .snapshot_dir
            .as_ref()
            .context("source.snapshot_dir missing for snapshots mode")?;
        let resolved = resolve_path(&calendar.path, dir)?;
        let pattern = resolved.join(&calendar.config.source.snapshot_glob);
        let pattern = pattern
            .to_str()
            .ok_or_else(|| anyhow!("snapshot path is not utf-8: {}", pattern.display()))?;

        let mut files = glob::glob(pattern)
            .with_context(|| format!("invalid snapshot glob {pattern}"))?
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("failed to list snapshots in {}", resolved.display()))?;
        files.retain(|path| path.is_file());
        files.sort();

        info!(
            calendar = %calendar.key(),
            dir = %resolved.display(),
            pages = files.len(),
            "snapshot pages discovered"
        );
        Ok(Self::new(files))
    }
}

impl PageSource for SnapshotPages {
    fn current_page(&mut self) -> Result<RenderedPage, SourceError> {
        let path = self.files.get(self.cursor).ok_or_else(|| {
            SourceError::NavigationStalled(format!("no snapshot at position {}", self.cursor))
        })?;
        let html = std::fs::read_to_string(path).map_err(|err| SourceError::Fetch {
            page: path.display().to_string(),
            source: err.into(),
        })?;
        debug!(file = %path.display(), bytes = html.len(), "loaded snapshot page");
        Ok(RenderedPage {
            label: path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string(),
            url: None,
            html,
        })
    }

    fn advance(&mut self) -> Result<bool, SourceError> {
        if self.cursor + 1 >= self.files.len() {
            return Ok(false);
        }
        self.cursor += 1;
        Ok(true)
    }
}

/// Server-rendered month grid addressed by a `{{year}}`/`{{month}}` URL
/// template.
pub struct HttpMonthPages {
    client: Client,
    url_template: String,
    year: i32,
    month: u32,
    retry_attempts: u8,
    retry_backoff_ms: u64,
}

impl HttpMonthPages {
    pub fn from_calendar(calendar: &LoadedCalendar) -> Result<Self> {
        let source = &calendar.config.source;
        let mut headers = HeaderMap::new();
        for (k, v) in &source.headers {
            let name = HeaderName::from_bytes(k.as_bytes())
                .with_context(|| format!("invalid header name {k}"))?;
            let value =
                HeaderValue::from_str(v).with_context(|| format!("invalid header value for {k}"))?;
            headers.insert(name, value);
        }
        if let Some(user_agent) = &source.user_agent {
            headers.insert(USER_AGENT, HeaderValue::from_str(user_agent)?);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(source.timeout_secs))
            .default_headers(headers)
            .build()
            .context("failed to build reqwest client")?;

        let url_template = source
            .url_template
            .clone()
            .context("source.url_template missing for http mode")?;

        let (year, month) = match source.start_month.as_deref() {
            Some(raw) => parse_year_month(raw)
                .ok_or_else(|| anyhow!("source.start_month must be YYYY-MM, got {raw}"))?,
            None => {
                let tz = calendar.config.timezone()?;
                let today = Utc::now().with_timezone(&tz).date_naive();
                (today.year(), today.month())
            }
        };

        Ok(Self {
            client,
            url_template,
            year,
            month,
            retry_attempts: source.retry_attempts,
            retry_backoff_ms: source.retry_backoff_ms,
        })
    }

    fn page_url(&self) -> String {
        self.url_template
            .replace("{{year}}", &self.year.to_string())
            .replace("{{month}}", &format!("{:02}", self.month))
    }

    fn label(&self) -> String {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
            .map(|d| d.format("%Y-%m").to_string())
            .unwrap_or_else(|| format!("{}-{:02}", self.year, self.month))
    }
}

impl PageSource for HttpMonthPages {
    fn current_page(&mut self) -> Result<RenderedPage, SourceError> {
        let url = self.page_url();
        let bytes = fetch_with_retries(
            &self.client,
            &url,
            self.retry_attempts,
            self.retry_backoff_ms,
        )
        .map_err(|source| SourceError::Fetch {
            page: url.clone(),
            source,
        })?;

        info!(url = %url, bytes = bytes.len(), "fetched month page");
        Ok(RenderedPage {
            label: self.label(),
            url: Some(url),
            html: String::from_utf8_lossy(&bytes).to_string(),
        })
    }

    fn advance(&mut self) -> Result<bool, SourceError> {
        if self.month == 12 {
            self.year += 1;
            self.month = 1;
        } else {
            self.month += 1;
        }
        Ok(true)
    }
}

fn fetch_with_retries(
    client: &Client,
    url: &str,
    retry_attempts: u8,
    retry_backoff_ms: u64,
) -> Result<Vec<u8>> {
    let attempts = retry_attempts.max(1);

    for attempt in 1..=attempts {
        match client.get(url).send() {
            Ok(resp) => {
                if !resp.status().is_success() {
                    let status = resp.status();
                    if attempt == attempts {
                        bail!("request to {url} failed with status {status}");
                    }
                    warn!(%url, %status, attempt, "request failed; retrying");
                } else {
                    return Ok(resp.bytes()?.to_vec());
                }
            }
            Err(err) => {
                if attempt == attempts {
                    return Err(err).with_context(|| format!("request to {url} failed"));
                }
                warn!(%url, attempt, error = %err, "request errored; retrying");
            }
        }

        std::thread::sleep(Duration::from_millis(retry_backoff_ms));
    }

    bail!("request to {url} failed after retries")
}
