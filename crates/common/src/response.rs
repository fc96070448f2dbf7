//! Response wrapper returned to the wallet shell.
//!
//! The UI boundary receives a success flag plus a structured error rather
//! than a bare error type; the shell turns failures into notifications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Standard JSON response wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StdResponse<T> {
    /// Whether the operation succeeded
    pub success: bool,
    /// Timestamp of the response
    pub timestamp: DateTime<Utc>,
    /// Error information if operation failed
    pub error: Option<StdError>,
    /// Response data if operation succeeded
    pub data: Option<T>,
}

impl<T> StdResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            timestamp: Utc::now(),
            error: None,
            data: Some(data),
        }
    }

    pub fn error(error: StdError) -> Self {
        Self {
            success: false,
            timestamp: Utc::now(),
            error: Some(error),
            data: None,
        }
    }
}

/// Standard error information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StdError {
    /// Error code for programmatic handling
    pub code: String,
    /// Human-readable error message
    pub message: String,
}

impl StdError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_carries_data_and_no_error() {
        let resp = StdResponse::success(42u32);
        assert!(resp.success);
        assert_eq!(resp.data, Some(42));
        assert!(resp.error.is_none());
    }

    #[test]
    fn error_carries_code_and_message() {
        let resp: StdResponse<()> =
            StdResponse::error(StdError::new("storage_init", "disk full"));
        assert!(!resp.success);
        assert!(resp.data.is_none());
        let err = resp.error.unwrap();
        assert_eq!(err.code, "storage_init");
        assert_eq!(err.message, "disk full");
    }
}
