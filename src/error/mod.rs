use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Insufficient credits")]
    InsufficientCredits,

    #[error("Account unavailable: {0}")]
    AccountUnavailable(String),

    #[error("All providers exhausted: {0}")]
    ProviderExhausted(String),

    #[error("Malformed provider response: {0}")]
    MalformedResponse(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl Error {
    pub fn platform(msg: impl Into<String>) -> Self {
        Error::Platform(msg.into())
    }

    pub fn account_unavailable(msg: impl Into<String>) -> Self {
        Error::AccountUnavailable(msg.into())
    }

    pub fn provider_exhausted(msg: impl Into<String>) -> Self {
        Error::ProviderExhausted(msg.into())
    }

    pub fn malformed_response(msg: impl Into<String>) -> Self {
        Error::MalformedResponse(msg.into())
    }

    pub fn provider(msg: impl Into<String>) -> Self {
        Error::Provider(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }
}
