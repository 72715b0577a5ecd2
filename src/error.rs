use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StreamError>;

#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum StreamError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Resource not found: {0}")]
    NotFoundError(String),

    #[error("Resource conflict: {0}")]
    ConflictError(String),

    #[error("Permission denied: {0}")]
    PermissionError(String),

    #[error("Evaluation error: {0}")]
    EvaluationError(String),

    #[error("Evaluation budget exceeded after {elapsed_ms:.2}ms (limit {limit_ms}ms)")]
    EvaluationBudgetExceeded { elapsed_ms: f64, limit_ms: u64 },

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Regex error: {0}")]
    RegexError(#[from] regex::Error),

    #[error("Config load error: {0}")]
    ConfigLoadError(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Metrics error: {0}")]
    MetricsError(#[from] prometheus::Error),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl StreamError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        StreamError::ConfigError(msg.into())
    }

    pub fn validation<S: Into<String>>(msg: S) -> Self {
        StreamError::ValidationError(msg.into())
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        StreamError::NotFoundError(msg.into())
    }

    pub fn conflict<S: Into<String>>(msg: S) -> Self {
        StreamError::ConflictError(msg.into())
    }

    pub fn permission<S: Into<String>>(msg: S) -> Self {
        StreamError::PermissionError(msg.into())
    }

    pub fn evaluation<S: Into<String>>(msg: S) -> Self {
        StreamError::EvaluationError(msg.into())
    }

    pub fn transport<S: Into<String>>(msg: S) -> Self {
        StreamError::TransportError(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        StreamError::InternalError(msg.into())
    }

    /// Stable machine-readable code reported to clients in command results.
    pub fn error_code(&self) -> &'static str {
        match self {
            StreamError::ConfigError(_) | StreamError::ConfigLoadError(_) => "CONFIG_ERROR",
            StreamError::ValidationError(_) | StreamError::RegexError(_) => "VALIDATION_ERROR",
            StreamError::NotFoundError(_) => "NOT_FOUND",
            StreamError::ConflictError(_) => "CONFLICT",
            StreamError::PermissionError(_) => "PERMISSION_DENIED",
            StreamError::EvaluationError(_) => "EVALUATION_ERROR",
            StreamError::EvaluationBudgetExceeded { .. } => "EVALUATION_BUDGET_EXCEEDED",
            StreamError::TransportError(_) => "TRANSPORT_ERROR",
            StreamError::SerializationError(_) => "SERIALIZATION_ERROR",
            StreamError::IoError(_) => "IO_ERROR",
            StreamError::MetricsError(_) => "METRICS_ERROR",
            StreamError::InternalError(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the error was caused by the caller's input rather than by the service.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            StreamError::ConfigError(_)
                | StreamError::ValidationError(_)
                | StreamError::RegexError(_)
                | StreamError::NotFoundError(_)
                | StreamError::ConflictError(_)
                | StreamError::PermissionError(_)
        )
    }

    pub fn to_payload(&self) -> serde_json::Value {
        // Internal failures are not echoed verbatim to clients.
        let message = if self.is_client_error() {
            self.to_string()
        } else {
            "An unexpected error occurred".to_string()
        };

        json!({
            "error": {
                "code": self.error_code(),
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }
        })
    }
}
