use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, RETRY_AFTER};

use super::HttpError;
use super::types::{ApiResponse, RemoteResource, WriteRequest};

/// Thin client for a JSON resource API rooted at `base_url`.
///
/// `GET/PUT/PATCH/DELETE {base_url}/resources/{provider_ref}`, bearer auth.
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpClient {
    pub fn new(base_url: String, token: Option<String>) -> Result<Self, HttpError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            let mut header_value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| HttpError::Auth {
                    message: "Invalid token format".to_string(),
                })?;
            header_value.set_sensitive(true);
            headers.insert(AUTHORIZATION, header_value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(HttpError::Network)?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn api_base(&self) -> &str {
        &self.base_url
    }

    fn resource_url(&self, provider_ref: &str) -> String {
        format!(
            "{}/resources/{}",
            self.base_url,
            urlencoding::encode(provider_ref)
        )
    }

    pub async fn get_resource(&self, provider_ref: &str) -> Result<RemoteResource, HttpError> {
        let response = self.client.get(self.resource_url(provider_ref)).send().await?;
        let response = check_status(response, provider_ref).await?;

        let body: ApiResponse<RemoteResource> =
            response
                .json()
                .await
                .map_err(|e| HttpError::InvalidResponse {
                    message: format!("Failed to parse response: {}", e),
                })?;

        if !body.success {
            return Err(HttpError::Api {
                status: 200,
                message: body.first_error().unwrap_or("Unknown error").to_string(),
            });
        }

        body.result.ok_or_else(|| HttpError::InvalidResponse {
            message: "response has no result".to_string(),
        })
    }

    /// Replace the resource, creating it if needed.
    pub async fn put_resource(
        &self,
        provider_ref: &str,
        request: &WriteRequest<'_>,
    ) -> Result<(), HttpError> {
        let response = self
            .client
            .put(self.resource_url(provider_ref))
            .json(request)
            .send()
            .await?;
        check_status(response, provider_ref).await.map(|_| ())
    }

    /// Merge the given attributes into the resource.
    pub async fn patch_resource(
        &self,
        provider_ref: &str,
        request: &WriteRequest<'_>,
    ) -> Result<(), HttpError> {
        let response = self
            .client
            .patch(self.resource_url(provider_ref))
            .json(request)
            .send()
            .await?;
        check_status(response, provider_ref).await.map(|_| ())
    }

    pub async fn delete_resource(&self, provider_ref: &str) -> Result<(), HttpError> {
        let response = self
            .client
            .delete(self.resource_url(provider_ref))
            .send()
            .await?;
        check_status(response, provider_ref).await.map(|_| ())
    }
}

/// Map non-success statuses to errors, pulling the message out of the
/// envelope when there is one.
async fn check_status(
    response: reqwest::Response,
    provider_ref: &str,
) -> Result<reqwest::Response, HttpError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::NOT_FOUND {
        return Err(HttpError::NotFound {
            provider_ref: provider_ref.to_string(),
        });
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        return Err(HttpError::RateLimited { retry_after });
    }

    let message = response
        .json::<ApiResponse<serde_json::Value>>()
        .await
        .ok()
        .and_then(|body| body.first_error().map(str::to_string))
        .unwrap_or_else(|| status.to_string());

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(HttpError::Auth { message });
    }

    Err(HttpError::Api {
        status: status.as_u16(),
        message,
    })
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("base_url", &self.base_url)
            .field("token", &"[REDACTED]")
            .finish()
    }
}
