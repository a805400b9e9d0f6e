use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Fetch Error - {0}")]
    Fetch(#[from] FetchError),

    #[error("Sink Error - {0}")]
    Sink(String),

    #[error("Watermark Error - {0}")]
    Watermark(String),

    #[error("Config Error - {0}")]
    Config(String),

    #[error("Task Error - {0}")]
    Task(String),
}

/// The single error kind every source failure is surfaced as. Transport details (timeouts, rate
/// limits, malformed payloads, auth) are folded into one of the two variants by the client.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    /// Network, timeout or rate-limit failures. Retried with backoff.
    #[error("transient - {0}")]
    Transient(String),

    /// Bad request or auth failures. The entity is abandoned for the current run.
    #[error("permanent - {0}")]
    Permanent(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(value: tokio::task::JoinError) -> Self {
        Error::Task(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            Error::Sink("writer gone".to_string()).to_string(),
            "Sink Error - writer gone"
        );
        assert_eq!(
            Error::from(FetchError::Permanent("401".to_string())).to_string(),
            "Fetch Error - permanent - 401"
        );
    }

    #[test]
    fn test_fetch_error_classification() {
        assert!(FetchError::Transient("timeout".to_string()).is_transient());
        assert!(!FetchError::Permanent("bad request".to_string()).is_transient());
    }
}
