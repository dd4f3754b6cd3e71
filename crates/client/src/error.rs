use tandem_core::{CoreError, SettingId};
use tandem_engine::{ErrorCode, wire::WireError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("disconnected: {0}")]
    Disconnected(String),

    #[error("remote error: {0}")]
    Remote(WireError),

    #[error("codec error: {0}")]
    Codec(#[from] CoreError),
}

impl TransportError {
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Remote(err) => Some(err.code),
            _ => None,
        }
    }

    pub fn is_stale_cursor(&self) -> bool {
        self.code() == Some(ErrorCode::StaleCursor)
    }

    /// The request never got an answer, so the session may have missed
    /// changes while the link was down.
    pub fn is_link_failure(&self) -> bool {
        matches!(self, Self::Timeout | Self::Disconnected(_))
    }

    /// Whether the same request may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::Disconnected(_) => true,
            Self::Remote(err) => err.code.is_retryable(),
            Self::Codec(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("session not connected")]
    NotConnected,

    #[error("publish blocked by locked settings with unsaved edits: {0:?}")]
    PublishBlocked(Vec<SettingId>),

    #[error("nothing to publish")]
    NothingToPublish,

    #[error("{0} is not locked")]
    NotLocked(SettingId),

    #[error("{0} has no local edit")]
    NoLocalEdit(SettingId),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),
}
