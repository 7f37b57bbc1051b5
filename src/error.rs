use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::state::{Stage, StageStatus};

/// Failure of a single provider call. Every network call site returns this so
/// the retry policy can decide between waiting and giving up.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("transient provider failure: {0}")]
    Retryable(Transient),

    #[error("provider failure: {0}")]
    Fatal(String),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum Transient {
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("server returned {status}: {body}")]
    Server { status: u16, body: String },

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("network error: {0}")]
    Network(String),

    #[error("response too short ({0} bytes)")]
    ShortResponse(usize),

    #[error("undecodable audio: {0}")]
    BadAudio(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Retryable(_))
    }

    /// Classifies a non-success HTTP status. 408, 429 and 5xx are worth
    /// another attempt, any other client error is not.
    pub fn from_status(status: u16, body: String, retry_after: Option<Duration>) -> Self {
        match status {
            429 => ProviderError::Retryable(Transient::RateLimited { retry_after }),
            408 | 500..=599 => ProviderError::Retryable(Transient::Server { status, body }),
            _ => ProviderError::Fatal(format!("status {status}: {body}")),
        }
    }

    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Retryable(Transient::Timeout(Duration::ZERO))
        } else if err.is_connect() || err.is_request() || err.is_body() {
            ProviderError::Retryable(Transient::Network(err.to_string()))
        } else if err.is_decode() {
            ProviderError::Fatal(format!("undecodable response: {err}"))
        } else {
            ProviderError::Retryable(Transient::Network(err.to_string()))
        }
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint {path} is corrupt: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("another run holds {path} (pid {pid})")]
    Locked { path: PathBuf, pid: String },

    #[error("stage {stage} cannot move from {from} to {to}")]
    InvalidTransition {
        stage: Stage,
        from: StageStatus,
        to: StageStatus,
    },

    #[error("stage {stage} requires {missing} to be done or skipped")]
    PrerequisiteNotMet { stage: Stage, missing: Stage },

    #[error("failed to encode checkpoint: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("checkpoint writer stopped unexpectedly")]
    WriterGone,
}

impl StateError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StateError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("nothing to assemble")]
    Empty,

    #[error("invalid sample rate {0}")]
    SampleRate(u32),

    #[error("expected {expected} join rules between chunks, got {got}")]
    PlanMismatch { expected: usize, got: usize },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid value for {field}: {message}")]
    Invalid { field: String, message: String },
}

/// Errors that abort a whole invocation rather than a single stage.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error("{0}")]
    Invocation(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(ProviderError::from_status(503, "busy".into(), None).is_retryable());
        assert!(ProviderError::from_status(500, String::new(), None).is_retryable());
        assert!(ProviderError::from_status(408, String::new(), None).is_retryable());
        assert!(!ProviderError::from_status(401, "bad key".into(), None).is_retryable());
        assert!(!ProviderError::from_status(422, String::new(), None).is_retryable());
    }

    #[test]
    fn test_rate_limit_keeps_hint() {
        let err = ProviderError::from_status(429, String::new(), Some(Duration::from_secs(7)));
        match err {
            ProviderError::Retryable(Transient::RateLimited { retry_after }) => {
                assert_eq!(retry_after, Some(Duration::from_secs(7)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_display_messages() {
        let err = StateError::PrerequisiteNotMet {
            stage: Stage::Audio,
            missing: Stage::Generate,
        };
        assert_eq!(
            err.to_string(),
            "stage audio requires generate to be done or skipped"
        );
        let err = ProviderError::Retryable(Transient::ShortResponse(44));
        assert!(err.to_string().contains("44 bytes"));
    }
}
