use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::resource::{Attributes, LiveObservation};

/// Response envelope: `{success, errors, result}`.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default)]
    pub errors: Vec<ApiError>,
    pub result: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn first_error(&self) -> Option<&str> {
        self.errors.first().map(|e| e.message.as_str())
    }
}

#[derive(Debug, Deserialize)]
pub struct ApiError {
    #[allow(dead_code)] // NOTE: kept for debug output
    pub code: u32,
    pub message: String,
}

/// A resource as the API reports it.
#[derive(Debug, Deserialize)]
pub struct RemoteResource {
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub observed_at: Option<DateTime<Utc>>,
}

impl RemoteResource {
    pub fn into_observation(self, provider_ref: &str) -> LiveObservation {
        LiveObservation {
            provider_ref: provider_ref.to_string(),
            observed_attributes: self.attributes,
            observed_at: self.observed_at.unwrap_or_else(Utc::now),
        }
    }
}

/// Body of PUT (replace) and PATCH (merge) requests.
#[derive(Debug, Serialize)]
pub struct WriteRequest<'a> {
    #[serde(rename = "type")]
    pub resource_type: &'a str,
    pub attributes: &'a Attributes,
    #[serde(skip_serializing_if = "no_fields")]
    pub removed: &'a [String],
}

fn no_fields(fields: &&[String]) -> bool {
    fields.is_empty()
}
