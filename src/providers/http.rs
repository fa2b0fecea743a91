mod client;
mod error;
mod types;

pub use client::HttpClient;
pub use error::HttpError;
pub use types::{ApiResponse, RemoteResource, WriteRequest};

use async_trait::async_trait;

use super::{Change, Provider, ProviderError};
use crate::plan::ActionKind;
use crate::resource::LiveObservation;

/// Provider that talks to a generic JSON resource API.
#[derive(Debug)]
pub struct HttpProvider {
    client: HttpClient,
}

impl HttpProvider {
    pub fn new(base_url: String, token: Option<String>) -> Result<Self, HttpError> {
        Ok(Self {
            client: HttpClient::new(base_url, token)?,
        })
    }

    pub fn client(&self) -> &HttpClient {
        &self.client
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn name(&self) -> &str {
        "http"
    }

    async fn fetch(&self, provider_ref: &str) -> Result<LiveObservation, ProviderError> {
        let resource = self.client.get_resource(provider_ref).await?;
        tracing::debug!(
            provider_ref,
            fields = resource.attributes.len(),
            "live attributes fetched"
        );
        Ok(resource.into_observation(provider_ref))
    }

    async fn apply(&self, change: &Change) -> Result<(), ProviderError> {
        let request = WriteRequest {
            resource_type: &change.resource_type,
            attributes: &change.attributes,
            removed: &change.removed,
        };

        match change.kind {
            ActionKind::Create | ActionKind::Recreate => {
                self.client.put_resource(&change.provider_ref, &request).await?
            }
            ActionKind::Update | ActionKind::Revert => {
                self.client
                    .patch_resource(&change.provider_ref, &request)
                    .await?
            }
            ActionKind::Delete => match self.client.delete_resource(&change.provider_ref).await {
                Ok(()) | Err(HttpError::NotFound { .. }) => {}
                Err(other) => return Err(other.into()),
            },
            ActionKind::Refresh => {}
        }

        tracing::info!(
            resource_id = %change.resource_id,
            provider_ref = %change.provider_ref,
            action = %change.kind,
            "change applied"
        );
        Ok(())
    }
}
