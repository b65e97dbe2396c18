//! API error types for the advertising API client.

use thiserror::Error;

use crate::auth::token::TokenError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("HTTP error: {status_code} - {message}")]
    Http {
        status_code: u16,
        error_code: String,
        message: String,
    },

    #[error("Rate limited (retry after {retry_after}s)")]
    RateLimited { retry_after: u64 },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Rejected by API: {code} - {details}")]
    Rejected { code: String, details: String },

    #[error("Token error: {0}")]
    Token(#[from] TokenError),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Request failed after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded { attempts: u32, last_error: String },
}

impl ApiError {
    /// Parse error from API response JSON.
    pub fn from_response(status_code: u16, body: &str) -> Self {
        if status_code == 401 {
            return Self::Unauthorized(body.to_string());
        }

        // Try to parse structured error response.
        if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
            let code = json
                .get("code")
                .and_then(|v| v.as_str())
                .unwrap_or("UNKNOWN")
                .to_string();
            let message = json
                .get("details")
                .or_else(|| json.get("message"))
                .and_then(|v| v.as_str())
                .unwrap_or(body)
                .to_string();

            return Self::Http {
                status_code,
                error_code: code,
                message,
            };
        }

        Self::Http {
            status_code,
            error_code: "UNKNOWN".to_string(),
            message: body.to_string(),
        }
    }

    pub fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }

    /// Whether this error is transient and worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::Network(_)
                | Self::Timeout(_)
                | Self::Http {
                    status_code: 500..=599,
                    ..
                }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_errors_retryable() {
        let err = ApiError::from_response(503, "unavailable");
        assert!(err.is_retryable());
        assert!(ApiError::RateLimited { retry_after: 1 }.is_retryable());
        assert!(ApiError::Timeout("slow".into()).is_retryable());
    }

    #[test]
    fn test_client_errors_not_retryable() {
        let err = ApiError::from_response(400, r#"{"code":"INVALID_ARGUMENT","details":"bad bid"}"#);
        assert!(!err.is_retryable());
        match err {
            ApiError::Http { error_code, message, .. } => {
                assert_eq!(error_code, "INVALID_ARGUMENT");
                assert_eq!(message, "bad bid");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(ApiError::from_response(401, ""), ApiError::Unauthorized(_)));
    }
}
