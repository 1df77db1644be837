use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;

use crate::error::{Error, Result};
use crate::platform::AppPaths;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub gateway: GatewayConfig,
    pub models: ModelChainConfig,
    pub orchestrator: OrchestratorSettings,
    pub ledger: LedgerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub api_endpoint: String,
    /// Ordered provider credentials. At least one is required; an empty
    /// pool fails at startup because no request could ever succeed.
    pub credentials: Vec<String>,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelChainConfig {
    pub primary: String,
    pub fallbacks: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    pub attempt_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Credits granted when a new account is provisioned.
    pub starting_credits: i64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig {
                api_endpoint: "https://gateway.linguamate.app".to_string(),
                credentials: Vec::new(), // Filled in during onboarding
                request_timeout_secs: 60,
            },
            models: ModelChainConfig {
                primary: "tutor-large".to_string(),
                fallbacks: vec!["tutor-medium".to_string(), "tutor-small".to_string()],
            },
            orchestrator: OrchestratorSettings {
                attempt_timeout_ms: 30_000,
            },
            ledger: LedgerConfig {
                starting_credits: 25,
            },
        }
    }
}

impl AppConfig {
    pub async fn load(paths: &AppPaths) -> Result<Self> {
        let config_file = paths.config_file();

        if !config_file.exists() {
            info!("Config file not found, creating default configuration");
            let default_config = Self::default();
            default_config.save(paths).await?;
            return Ok(default_config);
        }

        info!("Loading configuration from: {:?}", config_file);

        let config_content = fs::read_to_string(&config_file).await?;
        let config: AppConfig = toml::from_str(&config_content)
            .map_err(|e| Error::Config(config::ConfigError::Message(e.to_string())))?;

        config.validate()?;

        info!("Configuration loaded successfully");
        Ok(config)
    }

    pub async fn save(&self, paths: &AppPaths) -> Result<()> {
        let config_file = paths.config_file();

        let config_content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(config::ConfigError::Message(e.to_string())))?;

        fs::write(&config_file, config_content).await?;

        info!("Configuration saved to: {:?}", config_file);
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.gateway.api_endpoint.is_empty() {
            return Err(Error::validation("gateway api_endpoint cannot be empty"));
        }
        if self.gateway.credentials.is_empty() {
            return Err(Error::validation(
                "at least one gateway credential is required",
            ));
        }
        if self.gateway.credentials.iter().any(|c| c.is_empty()) {
            return Err(Error::validation("gateway credentials cannot be empty"));
        }
        if self.gateway.request_timeout_secs == 0 {
            return Err(Error::validation("request_timeout_secs must be positive"));
        }
        if self.models.primary.is_empty() {
            return Err(Error::validation("primary model cannot be empty"));
        }
        if self.models.fallbacks.iter().any(|m| m.is_empty()) {
            return Err(Error::validation("fallback models cannot be empty"));
        }
        if self.orchestrator.attempt_timeout_ms == 0 {
            return Err(Error::validation("attempt_timeout_ms must be positive"));
        }
        if self.ledger.starting_credits < 0 {
            return Err(Error::validation("starting_credits cannot be negative"));
        }

        Ok(())
    }
}
