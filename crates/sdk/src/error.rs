use sabycom_core::config::ConfigError;
use sabycom_core::error::EventBusError;
use sabycom_session::SessionError;
use sabycom_storage::KvError;

#[derive(Debug, thiserror::Error)]
pub enum SdkError {
    #[error("sabycom is not initialized, call initialize() with an app id first")]
    NotInitialized,

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("key-value storage error: {0}")]
    Kv(#[from] KvError),

    #[error("event bus error: {0}")]
    EventBus(#[from] EventBusError),
}
