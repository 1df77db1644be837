use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::app::config::AppConfig;
use crate::error::Result;
use crate::models::credentials::CredentialPool;
use crate::models::fallback::{ModelChain, OrchestratorConfig};
use crate::models::gateway::GatewayAdapter;
use crate::models::provider::ProviderAdapter;
use crate::platform::AppPaths;
use crate::storage::{CreditLedger, Database};

/// Process-wide wiring of the orchestration engine. The credential pool and
/// model chain are created once here and shared by every feature call, so
/// rotation progress carries across logical requests.
pub struct AppState {
    config: Arc<RwLock<AppConfig>>,
    paths: AppPaths,
    database: Database,
    ledger: Arc<CreditLedger>,
    credential_pool: Arc<CredentialPool>,
    model_chain: Arc<ModelChain>,
    adapter: Arc<dyn ProviderAdapter>,
}

impl AppState {
    pub async fn new(config: AppConfig, paths: AppPaths) -> Result<Self> {
        info!("Initializing application state");

        config.validate()?;

        let database = Database::new(&paths).await?;
        let ledger = Arc::new(CreditLedger::new(database.get_pool()));

        let credential_pool = Arc::new(CredentialPool::new(config.gateway.credentials.clone())?);
        let model_chain = Arc::new(ModelChain::new(
            config.models.primary.clone(),
            config.models.fallbacks.clone(),
        )?);
        let adapter: Arc<dyn ProviderAdapter> = Arc::new(GatewayAdapter::new(
            config.gateway.api_endpoint.clone(),
            Duration::from_secs(config.gateway.request_timeout_secs),
        )?);

        info!(
            credentials = credential_pool.len(),
            models = model_chain.len(),
            "orchestration engine ready"
        );

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            paths,
            database,
            ledger,
            credential_pool,
            model_chain,
            adapter,
        })
    }

    pub fn get_config(&self) -> AppConfig {
        self.config.read().clone()
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            attempt_timeout: Duration::from_millis(self.config.read().orchestrator.attempt_timeout_ms),
        }
    }

    pub fn get_paths(&self) -> &AppPaths {
        &self.paths
    }

    pub fn get_database(&self) -> &Database {
        &self.database
    }

    pub fn ledger(&self) -> Arc<CreditLedger> {
        self.ledger.clone()
    }

    pub fn credential_pool(&self) -> Arc<CredentialPool> {
        self.credential_pool.clone()
    }

    pub fn model_chain(&self) -> Arc<ModelChain> {
        self.model_chain.clone()
    }

    pub fn adapter(&self) -> Arc<dyn ProviderAdapter> {
        self.adapter.clone()
    }
}
