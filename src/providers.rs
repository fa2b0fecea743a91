pub mod fixture;
pub mod http;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::plan::ActionKind;
use crate::resource::{Attributes, LiveObservation};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
    #[error("not implemented: {0}")]
    NotImplemented(String),
    #[error("resource not found: {0}")]
    NotFound(String),
    /// Worth retrying: network trouble, throttling, server-side failures.
    #[error("transient provider error: {0}")]
    Transient(String),
    /// Throttled; the provider asked to wait before trying again.
    #[error("rate limited, retry after {}s", retry_after.as_secs())]
    RateLimited { retry_after: Duration },
    #[error("http provider error: {0}")]
    Http(String),
    #[error("provider configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Transient(_) | ProviderError::RateLimited { .. }
        )
    }

    /// How long the provider asked callers to back off, if it said.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

/// A write the reconciler asks a provider to perform.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub kind: ActionKind,
    pub resource_id: String,
    pub resource_type: String,
    pub provider_ref: String,
    /// Values to write. The full declaration for create/recreate, only the
    /// planned fields for update/revert, empty for delete.
    pub attributes: Attributes,
    /// Planned fields that are no longer declared and should be cleared.
    pub removed: Vec<String>,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self, provider_ref: &str) -> Result<LiveObservation, ProviderError>;

    async fn apply(&self, change: &Change) -> Result<(), ProviderError> {
        Err(ProviderError::NotImplemented(format!(
            "provider '{}' cannot apply {} for {}",
            self.name(),
            change.kind,
            change.resource_id
        )))
    }
}

/// Everything needed to build any of the bundled providers.
#[derive(Debug, Clone, Default)]
pub struct ProviderSettings {
    pub url: Option<String>,
    pub token: Option<String>,
    pub fixture: Option<PathBuf>,
}

pub fn get_provider(
    name: &str,
    settings: &ProviderSettings,
) -> Result<Arc<dyn Provider>, ProviderError> {
    match name {
        "http" => {
            let url = settings.url.clone().ok_or_else(|| {
                ProviderError::Config(
                    "No provider URL. Set DRIFTGUARD_PROVIDER_URL or use --provider-url"
                        .to_string(),
                )
            })?;
            let provider = http::HttpProvider::new(url, settings.token.clone())
                .map_err(ProviderError::from)?;
            Ok(Arc::new(provider))
        }
        "fixture" => {
            let path = settings.fixture.as_ref().ok_or_else(|| {
                ProviderError::Config("No fixture file. Use --fixture".to_string())
            })?;
            Ok(Arc::new(fixture::FixtureProvider::from_path(path)?))
        }
        other => Err(ProviderError::UnknownProvider(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ReadOnly;

    #[async_trait]
    impl Provider for ReadOnly {
        fn name(&self) -> &str {
            "read-only"
        }

        async fn fetch(&self, provider_ref: &str) -> Result<LiveObservation, ProviderError> {
            Err(ProviderError::NotFound(provider_ref.to_string()))
        }
    }

    #[test]
    fn test_get_provider_http() {
        let settings = ProviderSettings {
            url: Some("http://localhost:9000".to_string()),
            ..Default::default()
        };
        let provider = get_provider("http", &settings).unwrap();
        assert_eq!(provider.name(), "http");
    }

    #[test]
    fn test_get_provider_http_requires_url() {
        let result = get_provider("http", &ProviderSettings::default());
        match result {
            Err(ProviderError::Config(msg)) => assert!(msg.contains("DRIFTGUARD_PROVIDER_URL")),
            _ => panic!("expected Config error"),
        }
    }

    #[test]
    fn test_get_provider_unknown() {
        let result = get_provider("unknown", &ProviderSettings::default());
        match result {
            Err(ProviderError::UnknownProvider(name)) => assert_eq!(name, "unknown"),
            _ => panic!("expected UnknownProvider error"),
        }
    }

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(ProviderError::Transient("503".into()).is_transient());
        assert!(!ProviderError::NotFound("x".into()).is_transient());
        assert!(!ProviderError::Http("400".into()).is_transient());

        let throttled = ProviderError::RateLimited {
            retry_after: Duration::from_secs(7),
        };
        assert!(throttled.is_transient());
        assert_eq!(throttled.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(throttled.to_string(), "rate limited, retry after 7s");
        assert_eq!(ProviderError::Transient("503".into()).retry_after(), None);
    }

    #[tokio::test]
    async fn test_default_apply_not_implemented() {
        let change = Change {
            kind: ActionKind::Update,
            resource_id: "web".to_string(),
            resource_type: "instance".to_string(),
            provider_ref: "i-1".to_string(),
            attributes: Attributes::new(),
            removed: Vec::new(),
        };
        let err = ReadOnly.apply(&change).await.unwrap_err();
        assert!(matches!(err, ProviderError::NotImplemented(_)));
        assert!(err.to_string().contains("cannot apply update for web"));
    }
}
