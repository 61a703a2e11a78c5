use sabycom::SdkError;
use sabycom_api::ApiError;
use sabycom_core::config::ConfigError;
use sabycom_core::error::EventBusError;
use sabycom_storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum DemoError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("remote API error: {0}")]
    Api(#[from] ApiError),

    #[error("sdk error: {0}")]
    Sdk(#[from] SdkError),

    #[error("event bus error: {0}")]
    EventBus(#[from] EventBusError),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
