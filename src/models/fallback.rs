use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::models::credentials::{Credential, CredentialPool};
use crate::models::provider::{ProviderError, ProviderErrorKind, RawResponse};

/// A model identifier and its fixed position in the fallback chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub position: usize,
}

/// Ordered list of model identifiers: the configured primary first, then
/// static fallbacks. Immutable for the process lifetime; how far a single
/// request falls back is tracked by the orchestrator's own cursor, so one
/// request's fallback never changes which model the next request tries
/// first.
pub struct ModelChain {
    models: Vec<ModelDescriptor>,
}

impl ModelChain {
    pub fn new(primary: String, fallbacks: Vec<String>) -> Result<Self> {
        if primary.is_empty() {
            return Err(Error::validation("primary model identifier cannot be empty"));
        }
        if fallbacks.iter().any(|name| name.is_empty()) {
            return Err(Error::validation("fallback model identifiers cannot be empty"));
        }

        let models = std::iter::once(primary)
            .chain(fallbacks)
            .enumerate()
            .map(|(position, name)| ModelDescriptor { name, position })
            .collect();

        Ok(Self { models })
    }

    pub fn primary(&self) -> &ModelDescriptor {
        &self.models[0]
    }

    pub fn get(&self, position: usize) -> Option<&ModelDescriptor> {
        self.models.get(position)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Deadline for a single provider-call attempt. A hung call counts as a
    /// transient failure instead of stalling the loop.
    pub attempt_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

/// Cursor through the (model, credential) search space of one logical
/// request. Created fresh per request and discarded on completion.
#[derive(Debug, Clone, Copy)]
struct AttemptState {
    model_index: usize,
    credential_index: usize,
    attempts_on_model: usize,
}

/// Record of a single attempt, kept for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub model: String,
    pub credential_index: usize,
    pub attempt: usize,
    pub error: Option<String>,
}

/// Drives provider-call attempts across credentials and fallback models.
///
/// Transition rules after each attempt:
/// - success terminates the loop;
/// - quota or transient errors rotate to the next credential until the pool
///   is exhausted for the current model, then advance the model;
/// - a missing model advances the chain immediately, resetting the
///   credential cursor to the pool start;
/// - fatal adapter errors propagate without another attempt;
/// - past the last model the request fails with the last provider error.
///
/// Each iteration consumes one cell of the models x credentials grid, so the
/// loop runs at most `chain.len() * pool.len()` times.
pub struct RetryOrchestrator {
    pool: Arc<CredentialPool>,
    chain: Arc<ModelChain>,
    config: OrchestratorConfig,
}

impl RetryOrchestrator {
    pub fn new(pool: Arc<CredentialPool>, chain: Arc<ModelChain>, config: OrchestratorConfig) -> Self {
        Self { pool, chain, config }
    }

    pub async fn execute<F, Fut>(&self, mut call: F) -> Result<(RawResponse, Vec<AttemptRecord>)>
    where
        F: FnMut(ModelDescriptor, Credential) -> Fut,
        Fut: Future<Output = std::result::Result<RawResponse, ProviderError>>,
    {
        let mut state = AttemptState {
            model_index: 0,
            credential_index: self.pool.cursor(),
            attempts_on_model: 0,
        };
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut last_error: Option<ProviderError> = None;

        loop {
            let model = match self.chain.get(state.model_index) {
                Some(model) => model.clone(),
                None => {
                    let detail = last_error
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "no models configured".to_string());
                    warn!(attempts = attempts.len(), "fallback chain exhausted");
                    return Err(Error::ProviderExhausted(detail));
                }
            };

            let credential = self.pool.active();
            state.credential_index = credential.index();

            let outcome = match timeout(
                self.config.attempt_timeout,
                call(model.clone(), credential.clone()),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ProviderError::transient(format!(
                    "attempt deadline of {:?} expired",
                    self.config.attempt_timeout
                ))),
            };

            match outcome {
                Ok(raw) => {
                    attempts.push(AttemptRecord {
                        model: model.name.clone(),
                        credential_index: state.credential_index,
                        attempt: attempts.len() + 1,
                        error: None,
                    });
                    info!(
                        model = %model.name,
                        credential = state.credential_index,
                        attempts = attempts.len(),
                        "provider call succeeded"
                    );
                    return Ok((raw, attempts));
                }
                Err(err) => {
                    attempts.push(AttemptRecord {
                        model: model.name.clone(),
                        credential_index: state.credential_index,
                        attempt: attempts.len() + 1,
                        error: Some(err.to_string()),
                    });
                    debug!(
                        model = %model.name,
                        credential = state.credential_index,
                        kind = ?err.kind,
                        "provider attempt failed"
                    );

                    match err.kind {
                        ProviderErrorKind::Fatal => {
                            return Err(Error::Provider(err.to_string()));
                        }
                        ProviderErrorKind::QuotaExceeded | ProviderErrorKind::Transient
                            if state.attempts_on_model + 1 < self.pool.len() =>
                        {
                            self.pool.rotate();
                            state.attempts_on_model += 1;
                        }
                        _ => {
                            // Model gone, or every credential tried on it.
                            state.model_index += 1;
                            state.attempts_on_model = 0;
                            self.pool.reset_to_start();
                        }
                    }

                    last_error = Some(err);
                }
            }
        }
    }
}
