use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::models::credentials::Credential;
use crate::models::fallback::ModelDescriptor;
use crate::models::provider::{
    Feature, ProviderAdapter, ProviderError, ProviderPayload, RawResponse, TokenUsage,
};

/// Adapter for the LinguaMate model gateway, an OpenAI-compatible HTTP API.
/// Failures are classified into structured error kinds from the HTTP status
/// so the orchestrator never inspects vendor error text.
pub struct GatewayAdapter {
    client: Client,
    base_url: String,
}

impl GatewayAdapter {
    pub fn new(base_url: String, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::provider(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, base_url })
    }

    fn endpoint(&self, feature: Feature) -> String {
        let path = match feature {
            Feature::Speech => "/v1/audio/speech",
            Feature::Image => "/v1/images/generations",
            _ => "/v1/chat/completions",
        };
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn headers(credential: &Credential) -> std::result::Result<HeaderMap, ProviderError> {
        let mut headers = HeaderMap::new();

        let auth_value = HeaderValue::from_str(&format!("Bearer {}", credential.secret()))
            .map_err(|e| ProviderError::fatal(format!("invalid credential format: {}", e)))?;
        headers.insert(AUTHORIZATION, auth_value);

        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        Ok(headers)
    }

    fn classify_status(status: StatusCode, detail: String) -> ProviderError {
        if status == StatusCode::TOO_MANY_REQUESTS {
            ProviderError::quota(detail)
        } else if status == StatusCode::NOT_FOUND {
            ProviderError::model_unavailable(detail)
        } else if status.is_server_error() {
            ProviderError::transient(detail)
        } else {
            ProviderError::fatal(detail)
        }
    }

    fn classify_transport(err: reqwest::Error) -> ProviderError {
        if err.is_timeout() || err.is_connect() {
            ProviderError::transient(err.to_string())
        } else {
            ProviderError::fatal(err.to_string())
        }
    }

    fn extract_usage(body: &serde_json::Value) -> Option<TokenUsage> {
        let usage = body.get("usage")?;
        let input = usage.get("prompt_tokens")?.as_u64()? as u32;
        let output = usage.get("completion_tokens")?.as_u64()? as u32;
        Some(TokenUsage::new(input, output))
    }
}

#[async_trait]
impl ProviderAdapter for GatewayAdapter {
    async fn call(
        &self,
        model: &ModelDescriptor,
        credential: &Credential,
        payload: ProviderPayload,
    ) -> std::result::Result<RawResponse, ProviderError> {
        let url = self.endpoint(payload.feature);
        let headers = Self::headers(credential)?;

        let mut body = payload.body;
        if let Some(object) = body.as_object_mut() {
            object.insert("model".to_string(), serde_json::json!(model.name));
        }

        debug!(
            model = %model.name,
            credential = credential.index(),
            feature = payload.feature.as_str(),
            "dispatching provider call"
        );

        let response = self
            .client
            .post(&url)
            .headers(headers)
            .json(&body)
            .send()
            .await
            .map_err(Self::classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            error!(%status, "gateway returned error status");
            return Err(Self::classify_status(
                status,
                format!("gateway responded {}: {}", status, detail),
            ));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::fatal(format!("response body was not valid JSON: {}", e)))?;

        let usage = Self::extract_usage(&body);

        Ok(RawResponse {
            request_id: payload.request_id,
            model: model.name.clone(),
            body,
            usage,
            received_at: Utc::now(),
        })
    }

    fn name(&self) -> &str {
        "gateway"
    }
}
