use std::time::Duration;

use thiserror::Error;

use crate::providers::ProviderError;

/// Errors from the JSON resource API.
///
/// SECURITY: Error messages must NEVER contain the bearer token.
#[derive(Debug, Error)]
pub enum HttpError {
    /// Token rejected (401/403)
    #[error("authentication failed: {message}")]
    Auth { message: String },

    /// API returned an error response
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Network-level error (connection failed, timeout, etc.)
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("rate limited, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },

    #[error("resource not found: '{provider_ref}'")]
    NotFound { provider_ref: String },

    #[error("invalid response: {message}")]
    InvalidResponse { message: String },
}

impl HttpError {
    pub fn is_transient(&self) -> bool {
        match self {
            HttpError::Network(_) | HttpError::RateLimited { .. } => true,
            HttpError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<HttpError> for ProviderError {
    fn from(err: HttpError) -> Self {
        match err {
            HttpError::NotFound { provider_ref } => ProviderError::NotFound(provider_ref),
            HttpError::RateLimited { retry_after } => ProviderError::RateLimited {
                retry_after: Duration::from_secs(retry_after),
            },
            other if other.is_transient() => ProviderError::Transient(other.to_string()),
            other => ProviderError::Http(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_display() {
        let err = HttpError::Api {
            status: 403,
            message: "Forbidden".to_string(),
        };
        assert_eq!(err.to_string(), "API error (403): Forbidden");
    }

    #[test]
    fn test_rate_limited_display() {
        let err = HttpError::RateLimited { retry_after: 60 };
        assert_eq!(err.to_string(), "rate limited, retry after 60s");
    }

    #[test]
    fn test_not_found_maps_to_provider_not_found() {
        let err: ProviderError = HttpError::NotFound {
            provider_ref: "vol-1".to_string(),
        }
        .into();
        assert!(matches!(err, ProviderError::NotFound(ref r) if r == "vol-1"));
    }

    #[test]
    fn test_server_errors_are_transient() {
        let err: ProviderError = HttpError::Api {
            status: 503,
            message: "unavailable".to_string(),
        }
        .into();
        assert!(err.is_transient());

        let err: ProviderError = HttpError::RateLimited { retry_after: 1 }.into();
        assert!(err.is_transient());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_client_errors_are_permanent() {
        let err: ProviderError = HttpError::Api {
            status: 422,
            message: "bad field".to_string(),
        }
        .into();
        assert!(matches!(err, ProviderError::Http(_)));

        let err: ProviderError = HttpError::Auth {
            message: "Invalid API Token".to_string(),
        }
        .into();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("authentication failed"));
    }

    #[test]
    fn test_error_does_not_contain_token() {
        let fake_token = "dg_super_secret_token_12345";
        let err = HttpError::Auth {
            message: "Invalid API Token".to_string(),
        };
        assert!(
            !err.to_string().contains(fake_token),
            "Error message should not contain token value"
        );
    }
}
