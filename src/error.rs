use reqwest::StatusCode;
use thiserror::Error;

/// Everything that can go wrong while reading the meter.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to meter failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("meter did not answer within the request timeout")]
    Timeout,
    #[error("meter answered with HTTP {0}")]
    Status(StatusCode),
    #[error("meter response is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("meter API reported status {code}: {reason}")]
    ApiStatus { code: i64, reason: String },
    #[error("meter response is missing `{0}`")]
    MissingField(&'static str),
}

impl FetchError {
    /// Short label used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Transport(_) => "transport",
            FetchError::Timeout => "timeout",
            FetchError::Status(_) => "http-status",
            FetchError::Decode(_) => "decode",
            FetchError::ApiStatus { .. } => "api-status",
            FetchError::MissingField(_) => "missing-field",
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Transport(err)
        }
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("path {0} is already registered")]
    DuplicatePath(String),
    #[error("path {0} is not registered")]
    UnknownPath(String),
    #[error("invalid value payload: {0}")]
    InvalidPayload(String),
    #[error("bus publish failed: {0}")]
    Publish(String),
}

/// Reason a polling cycle fell back to the degraded publish.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Bus(#[from] BusError),
}

impl CycleError {
    pub fn kind(&self) -> &'static str {
        match self {
            CycleError::Fetch(e) => e.kind(),
            CycleError::Bus(_) => "bus",
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("meter url `{0}` must start with http://")]
    MeterUrl(String),
}
