use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("network error: {0}")]
    Network(#[source] reqwest::Error),
    #[error("http {status}: {message}")]
    Http { status: u16, message: String },
    #[error("authentication required: {0}")]
    Auth(String),
    #[error("live channel error: {0}")]
    Channel(String),
    #[error("failed to decode response body: {0}")]
    Decode(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("session storage failed: {source}")]
    Storage { source: anyhow::Error },
}

impl ClientError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    pub(crate) fn storage(source: anyhow::Error) -> Self {
        Self::Storage { source }
    }
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("no refresh token is available")]
    MissingRefreshToken,
    #[error("session was cleared while waiting for refresh")]
    SessionCleared,
    #[error("refresh rejected with http {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("refresh request failed: {0}")]
    Network(#[source] reqwest::Error),
    #[error("refresh response could not be decoded: {0}")]
    Decode(String),
    #[error("refresh task stopped: {0}")]
    Interrupted(String),
    #[error("failed to persist refreshed session: {source}")]
    Storage { source: anyhow::Error },
}

impl From<RefreshError> for ClientError {
    fn from(value: RefreshError) -> Self {
        Self::Auth(value.to_string())
    }
}
