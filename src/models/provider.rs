use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::models::credentials::Credential;
use crate::models::fallback::ModelDescriptor;

/// One provider-call attempt, supplied by a feature executor and driven by
/// the retry orchestrator. Implementations must return a classified
/// [`ProviderError`] rather than encoding failure kinds in message text.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn call(
        &self,
        model: &ModelDescriptor,
        credential: &Credential,
        payload: ProviderPayload,
    ) -> std::result::Result<RawResponse, ProviderError>;

    fn name(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    ChatTurn,
    Translation,
    Summary,
    Speech,
    Image,
    ExerciseSet,
    Roleplay,
}

impl Feature {
    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::ChatTurn => "chat_turn",
            Feature::Translation => "translation",
            Feature::Summary => "summary",
            Feature::Speech => "speech",
            Feature::Image => "image",
            Feature::ExerciseSet => "exercise_set",
            Feature::Roleplay => "roleplay",
        }
    }
}

/// Feature-tagged request body handed to the adapter. The orchestrator may
/// dispatch the same payload several times against different
/// (model, credential) pairs; the adapter injects the model identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderPayload {
    pub request_id: String,
    pub feature: Feature,
    pub body: serde_json::Value,
}

impl ProviderPayload {
    pub fn new(feature: Feature, body: serde_json::Value) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            feature,
            body,
        }
    }
}

/// Transport-level success. Parsing into a typed feature result happens in
/// the feature executor, after the charge is applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawResponse {
    pub request_id: String,
    pub model: String,
    pub body: serde_json::Value,
    pub usage: Option<TokenUsage>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// The active credential hit a rate or usage limit.
    QuotaExceeded,
    /// The requested model is gone from this provider.
    ModelUnavailable,
    /// Network failure, timeout, or a 5xx from the gateway.
    Transient,
    /// Unusable request or credential; retrying cannot help.
    Fatal,
}

#[derive(Debug, Clone)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn quota(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::QuotaExceeded, message)
    }

    pub fn model_unavailable(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::ModelUnavailable, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Transient, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Fatal, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind != ProviderErrorKind::Fatal
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ProviderError {}
