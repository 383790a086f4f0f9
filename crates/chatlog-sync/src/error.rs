use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("archive error: {0}")]
    Api(#[from] chatlog_api::ApiError),
    #[error("storage error: {0}")]
    Storage(#[from] chatlog_storage::StorageError),
    #[error("config error: {0}")]
    Config(#[from] chatlog_config::ConfigError),
    #[error("refresh of {conversation_id} timed out after {timeout_ms} ms")]
    Timeout {
        conversation_id: String,
        timeout_ms: u64,
    },
    #[error("refresh task for {0} ended without an outcome")]
    Closed(String),
}
