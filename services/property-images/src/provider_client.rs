use crate::config::ProviderConfig;
use crate::resolver::ProviderPropertyId;
use async_trait::async_trait;
use axum::http::StatusCode;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

const CLIENT_ID_HEADER: &str = "x-buildium-client-id";
const CLIENT_SECRET_HEADER: &str = "x-buildium-client-secret";

/// Image object as returned by the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProviderImage {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub file_type: Option<String>,
    #[serde(default)]
    pub file_size: Option<i64>,
    #[serde(default)]
    pub is_private: Option<bool>,
    #[serde(default, alias = "Url")]
    pub href: Option<String>,
    #[serde(default)]
    pub sort_order: Option<i32>,
}

/// Upload payload forwarded to the provider
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProviderImageUpload {
    pub file_name: String,
    /// Base64 payload without any data-URL prefix
    pub file_data: String,
    pub description: Option<String>,
}

/// New display order for a property's images
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageOrder {
    pub image_ids: Vec<i64>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Non-2xx answer; `details` holds the response body
    #[error("provider responded with HTTP {status}")]
    Status {
        status: u16,
        details: serde_json::Value,
    },

    #[error("provider request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

impl ProviderError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ProviderError::Status { status, .. } => StatusCode::from_u16(*status).ok(),
            ProviderError::Transport(e) => e
                .status()
                .and_then(|s| StatusCode::from_u16(s.as_u16()).ok()),
        }
    }

    pub fn details(&self) -> serde_json::Value {
        match self {
            ProviderError::Status { details, .. } => details.clone(),
            ProviderError::Transport(e) => serde_json::Value::String(e.to_string()),
        }
    }
}

/// Image endpoints of the remote property-management provider
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProviderImageService: Send + Sync {
    async fn list_images(
        &self,
        property: ProviderPropertyId,
    ) -> Result<Vec<ProviderImage>, ProviderError>;

    async fn upload_image(
        &self,
        property: ProviderPropertyId,
        upload: ProviderImageUpload,
    ) -> Result<ProviderImage, ProviderError>;

    async fn reorder_images(
        &self,
        property: ProviderPropertyId,
        order: ImageOrder,
    ) -> Result<Vec<ProviderImage>, ProviderError>;
}

/// Buildium REST client with static credentials
pub struct BuildiumClient {
    base_url: String,
    client: reqwest::Client,
}

impl BuildiumClient {
    pub fn new(config: &ProviderConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CLIENT_ID_HEADER, HeaderValue::from_str(&config.client_id)?);
        let mut secret = HeaderValue::from_str(&config.client_secret)?;
        secret.set_sensitive(true);
        headers.insert(CLIENT_SECRET_HEADER, secret);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn images_url(&self, property: ProviderPropertyId) -> String {
        format!("{}/rentals/{}/images", self.base_url, property)
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        operation: &'static str,
        response: reqwest::Response,
    ) -> Result<T, ProviderError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let details = serde_json::from_str(&body)
                .unwrap_or_else(|_| serde_json::Value::String(body));
            warn!(operation, status = status.as_u16(), "Provider request rejected");
            metrics::counter!("property_images.provider.errors", "operation" => operation)
                .increment(1);
            return Err(ProviderError::Status {
                status: status.as_u16(),
                details,
            });
        }

        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl ProviderImageService for BuildiumClient {
    #[instrument(skip(self), fields(provider_id = %property))]
    async fn list_images(
        &self,
        property: ProviderPropertyId,
    ) -> Result<Vec<ProviderImage>, ProviderError> {
        let response = self.client.get(self.images_url(property)).send().await?;
        let images: Vec<ProviderImage> = Self::read_json("list_images", response).await?;

        debug!(count = images.len(), "Listed provider images");
        Ok(images)
    }

    #[instrument(skip(self, upload), fields(provider_id = %property, file_name = %upload.file_name))]
    async fn upload_image(
        &self,
        property: ProviderPropertyId,
        upload: ProviderImageUpload,
    ) -> Result<ProviderImage, ProviderError> {
        let response = self
            .client
            .post(self.images_url(property))
            .json(&upload)
            .send()
            .await?;

        Self::read_json("upload_image", response).await
    }

    #[instrument(skip(self), fields(provider_id = %property))]
    async fn reorder_images(
        &self,
        property: ProviderPropertyId,
        order: ImageOrder,
    ) -> Result<Vec<ProviderImage>, ProviderError> {
        let response = self
            .client
            .put(format!("{}/order", self.images_url(property)))
            .json(&order)
            .send()
            .await?;

        Self::read_json("reorder_images", response).await
    }
}
