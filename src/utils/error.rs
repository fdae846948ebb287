use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("Authentication failed: {message}")]
    Auth { message: String },

    #[error("Request throttled: {message}")]
    Throttle {
        message: String,
        retry_after: Option<std::time::Duration>,
    },

    #[error("Transient network error: {message}")]
    TransientNetwork { message: String },

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Item not found: {message}")]
    NotFound { message: String },

    #[error("Retries exhausted after {attempts} attempts: {last}")]
    ExhaustedRetries { attempts: u32, last: Box<ImportError> },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("A batch is already running: {batch_id}")]
    AlreadyRunning { batch_id: String },

    #[error("Batch not found: {batch_id}")]
    BatchNotFound { batch_id: String },

    #[error("Invalid batch transition from {from} on {action}")]
    InvalidTransition { from: String, action: String },

    #[error("Unexpected API response: {message}")]
    UnexpectedResponse { message: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Catalog store error: {message}")]
    Catalog { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Invalid configuration value for '{field}': {value} ({reason})")]
    InvalidConfigValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required configuration: {field}")]
    MissingConfig { field: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Api,
    Data,
    Batch,
    Storage,
    Configuration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// 對外輸出的結構化錯誤 `{ kind, message }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: String,
    pub message: String,
}

impl ImportError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// 穩定的錯誤種類名稱，用於結構化結果與錯誤紀錄
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::Throttle { .. } => "throttle",
            Self::TransientNetwork { .. } => "transient_network",
            Self::Validation { .. } => "validation",
            Self::NotFound { .. } => "not_found",
            Self::ExhaustedRetries { .. } => "exhausted_retries",
            Self::Cancelled => "cancelled",
            Self::AlreadyRunning { .. } => "already_running",
            Self::BatchNotFound { .. } => "batch_not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::UnexpectedResponse { .. } => "unexpected_response",
            Self::Storage { .. } => "storage",
            Self::Catalog { .. } => "catalog",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
            Self::Config { .. } | Self::InvalidConfigValue { .. } | Self::MissingConfig { .. } => {
                "config"
            }
        }
    }

    /// 批次中是否值得將該項目重新排入佇列
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Throttle { .. }
                | Self::TransientNetwork { .. }
                | Self::ExhaustedRetries { .. }
                | Self::UnexpectedResponse { .. }
                | Self::Storage { .. }
                | Self::Catalog { .. }
                | Self::Io(_)
        )
    }

    /// Auth 錯誤（包含被包裝在 ExhaustedRetries 內的）
    pub fn is_auth(&self) -> bool {
        match self {
            Self::Auth { .. } => true,
            Self::ExhaustedRetries { last, .. } => last.is_auth(),
            _ => false,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Auth { .. }
            | Self::Throttle { .. }
            | Self::TransientNetwork { .. }
            | Self::ExhaustedRetries { .. }
            | Self::UnexpectedResponse { .. } => ErrorCategory::Api,
            Self::Validation { .. } | Self::NotFound { .. } | Self::Serialization(_) => {
                ErrorCategory::Data
            }
            Self::Cancelled
            | Self::AlreadyRunning { .. }
            | Self::BatchNotFound { .. }
            | Self::InvalidTransition { .. } => ErrorCategory::Batch,
            Self::Storage { .. } | Self::Catalog { .. } | Self::Io(_) => ErrorCategory::Storage,
            Self::Config { .. } | Self::InvalidConfigValue { .. } | Self::MissingConfig { .. } => {
                ErrorCategory::Configuration
            }
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Cancelled | Self::NotFound { .. } => ErrorSeverity::Low,
            Self::Throttle { .. }
            | Self::TransientNetwork { .. }
            | Self::AlreadyRunning { .. }
            | Self::ExhaustedRetries { .. } => ErrorSeverity::Medium,
            Self::Validation { .. }
            | Self::BatchNotFound { .. }
            | Self::InvalidTransition { .. }
            | Self::UnexpectedResponse { .. }
            | Self::Serialization(_)
            | Self::Catalog { .. } => ErrorSeverity::High,
            Self::Auth { .. }
            | Self::Storage { .. }
            | Self::Io(_)
            | Self::Config { .. }
            | Self::InvalidConfigValue { .. }
            | Self::MissingConfig { .. } => ErrorSeverity::Critical,
        }
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "Check the access key, secret key and partner tag for the selected marketplace",
            Self::Throttle { .. } | Self::ExhaustedRetries { .. } => {
                "Wait a few minutes and retry, or lower the request rate"
            }
            Self::TransientNetwork { .. } => "Check network connectivity and retry",
            Self::Validation { .. } => "Item codes must be 10 upper-case letters or digits",
            Self::NotFound { .. } => "The item is not available in this marketplace",
            Self::AlreadyRunning { .. } => "Wait for the running batch to finish or cancel it",
            Self::BatchNotFound { .. } => "Check the batch id; finished batches expire after the retention period",
            Self::InvalidTransition { .. } => "Query the batch status before pausing, resuming or cancelling",
            Self::Storage { .. } | Self::Io(_) => "Check that the data directory exists and is writable",
            Self::Config { .. } | Self::InvalidConfigValue { .. } | Self::MissingConfig { .. } => {
                "Fix the configuration file and try again"
            }
            _ => "Retry the operation; if it keeps failing, run with --verbose",
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self {
            Self::ExhaustedRetries { attempts, last } => {
                format!("Gave up after {} attempts: {}", attempts, last)
            }
            other => other.to_string(),
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            kind: self.kind().to_string(),
            message: self.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ImportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(ImportError::TransientNetwork { message: "reset".into() }.is_retryable());
        assert!(!ImportError::validation("bad code").is_retryable());
        assert!(!ImportError::NotFound { message: "gone".into() }.is_retryable());
        assert!(!ImportError::Auth { message: "denied".into() }.is_retryable());
    }

    #[test]
    fn test_exhausted_retries_keeps_auth_cause() {
        let err = ImportError::ExhaustedRetries {
            attempts: 3,
            last: Box::new(ImportError::Auth { message: "expired".into() }),
        };
        assert!(err.is_auth());
        assert_eq!(err.kind(), "exhausted_retries");
        assert!(err.user_friendly_message().contains("3 attempts"));
    }

    #[test]
    fn test_payload_shape() {
        let payload = ImportError::validation("bad").to_payload();
        assert_eq!(payload.kind, "validation");
        assert_eq!(payload.message, "Validation error: bad");
    }
}
