pub mod credentials;
pub mod fallback;
pub mod gateway;
pub mod provider;

pub use credentials::{Credential, CredentialPool};
pub use fallback::{
    AttemptRecord, ModelChain, ModelDescriptor, OrchestratorConfig, RetryOrchestrator,
};
pub use gateway::GatewayAdapter;
pub use provider::{
    Feature, ProviderAdapter, ProviderError, ProviderErrorKind, ProviderPayload, RawResponse,
    TokenUsage,
};
