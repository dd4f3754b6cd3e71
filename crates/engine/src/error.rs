use serde::{Deserialize, Serialize};
use tandem_core::{CoreError, SettingId, SettingValue, StoreGeneration, User};
use tandem_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationError {
    #[error("not logged in")]
    NotLoggedIn,

    #[error("unauthorized")]
    Unauthorized,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("concurrency conflict on {setting_id}: changed by {} since the session last synced", their_author.display_name)]
    ValidationConflict {
        setting_id: SettingId,
        their_value: SettingValue,
        their_author: User,
    },

    #[error("preview of {setting_id} rejected: locked by {}", locked_by.display_name)]
    PreviewRejected {
        setting_id: SettingId,
        their_value: SettingValue,
        locked_by: User,
    },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("stale cursor: issued by generation {cursor}, store is at {current}")]
    StaleCursor {
        cursor: StoreGeneration,
        current: StoreGeneration,
    },

    #[error("authorization error: {0}")]
    Authorization(#[from] AuthorizationError),

    #[error("unknown setting: {0}")]
    UnknownSetting(SettingId),

    #[error("no settings supplied")]
    EmptyBatch,

    #[error("core error: {0}")]
    Core(#[from] CoreError),
}

/// Stable machine-readable error codes used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ValidationConflict,
    PreviewRejected,
    StorageError,
    StaleCursor,
    NotLoggedIn,
    Unauthorized,
    UnknownSetting,
    CustomizedEmpty,
    /// A request that needs a cursor arrived without one.
    #[serde(rename = "missing_last_update_timestamp_cursor")]
    MissingCursor,
    BadRequest,
}

impl ErrorCode {
    /// Whether retrying the same request later can succeed without user action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageError | Self::PreviewRejected)
    }
}

impl SyncError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::ValidationConflict { .. } => ErrorCode::ValidationConflict,
            Self::PreviewRejected { .. } => ErrorCode::PreviewRejected,
            Self::Storage(_) => ErrorCode::StorageError,
            Self::StaleCursor { .. } => ErrorCode::StaleCursor,
            Self::Authorization(AuthorizationError::NotLoggedIn) => ErrorCode::NotLoggedIn,
            Self::Authorization(AuthorizationError::Unauthorized) => ErrorCode::Unauthorized,
            Self::UnknownSetting(_) => ErrorCode::UnknownSetting,
            Self::EmptyBatch => ErrorCode::CustomizedEmpty,
            Self::Core(_) => ErrorCode::BadRequest,
        }
    }
}
