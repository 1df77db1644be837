pub mod config;
pub mod state;

pub use config::{AppConfig, GatewayConfig, LedgerConfig, ModelChainConfig, OrchestratorSettings};
pub use state::AppState;

/// Console logging setup for binaries and integration harnesses embedding
/// this engine. Library code only emits `tracing` events.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("linguamate=info")),
        )
        .init();
}
