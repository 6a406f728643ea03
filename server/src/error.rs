use derive_more::derive::Display;
use reqwest::StatusCode;

pub type AppResult<T> = Result<T, AppError>;

/// Pipeline error taxonomy. Transient errors retry with backoff and count
/// toward the circuit breaker; contract violations get one simplified-prompt
/// retry; everything else fails the attempt outright.
#[derive(Debug, Display)]
pub enum AppError {
    NotFound(String),
    Conflict(String),
    Transient(String),
    RequestTimeout,
    TooManyRequests,
    CircuitOpen(String),
    Contract(String),
    Config(String),
    Internal(anyhow::Error),
}

impl std::error::Error for AppError {}

impl AppError {
    /// Errors worth retrying against the same dependency.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::Transient(_) | AppError::RequestTimeout | AppError::TooManyRequests
        )
    }

    pub fn is_contract_violation(&self) -> bool {
        matches!(self, AppError::Contract(_))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::Internal(error)
    }
}

impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        tracing::error!("Reqwest error: {:?}", error);
        if error.is_timeout() || error.is_connect() {
            return AppError::Transient(error.to_string());
        }
        match error.status() {
            Some(StatusCode::REQUEST_TIMEOUT) => AppError::RequestTimeout,
            Some(StatusCode::TOO_MANY_REQUESTS) => AppError::TooManyRequests,
            Some(status) if status.is_server_error() => AppError::Transient(error.to_string()),
            _ => AppError::Internal(error.into()),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        AppError::Contract(error.to_string())
    }
}
