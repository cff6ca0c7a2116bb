use thiserror::Error;

/// Failures surfaced to callers of the scanner and the HTTP API.
///
/// Probe-level network failures (refused, timed out, unreachable) never show up
/// here; the prober reports them as an unsuccessful outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error("invalid scan configuration: {0}")]
    InvalidConfig(String),

    #[error("line {line}: invalid range syntax: {text}")]
    InvalidRangeSyntax { line: usize, text: String },

    #[error("invalid port specification: {0}")]
    InvalidPortSpec(String),

    #[error("a scan is already running")]
    ScanAlreadyRunning,

    #[error("no active scan")]
    NotRunning,

    #[error("scan is not paused")]
    NotPaused,

    #[error("not authenticated")]
    Unauthenticated,

    #[error("country lookup failed: {0}")]
    CountryLookup(String),

    #[error("persistence error: {0}")]
    Persistence(String),
}

impl ScanError {
    /// True for errors caused by the request contents rather than scanner state.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            ScanError::InvalidConfig(_)
                | ScanError::InvalidRangeSyntax { .. }
                | ScanError::InvalidPortSpec(_)
        )
    }
}

pub type ScanResult<T> = std::result::Result<T, ScanError>;
