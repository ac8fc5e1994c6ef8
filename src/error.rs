use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExtractError {
    #[error("fragment has no usable title text")]
    FragmentUnresolvable,
    #[error("no enclosing day cell carries a date for fragment {title:?}")]
    DateContextMissing { title: String },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("time text {0:?} matches no known clock pattern")]
    MalformedTime(String),
}

/// Failures reported by a remote calendar store. Every variant is scoped to a
/// single event.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("transient remote failure: {0}")]
    Transient(String),
    #[error("remote rejected event: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("navigation stalled: {0}")]
    NavigationStalled(String),
    #[error("failed to load page {page}: {source}")]
    Fetch {
        page: String,
        #[source]
        source: anyhow::Error,
    },
}
