//! Failure values crossing the adapter → engine boundary.
use crate::model::Service;
use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{0} is not connected")]
    NotConnected(Service),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("unresolvable reference: {0}")]
    Unresolvable(String),
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("{0} does not support this operation")]
    Unsupported(Service),
    #[error("authorization failed: {0}")]
    Auth(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl SyncError {
    /// Maps a non-success HTTP status into the taxonomy.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let body: String = body.chars().take(300).collect();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                SyncError::Auth(format!("{}: {}", status, body))
            }
            _ => SyncError::Transient(format!("{}: {}", status, body)),
        }
    }

    pub fn malformed(what: impl Into<String>) -> Self {
        SyncError::Malformed(what.into())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SyncError::Malformed(err.to_string())
        } else {
            SyncError::Transient(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Malformed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert!(matches!(
            SyncError::from_status(StatusCode::UNAUTHORIZED, "revoked"),
            SyncError::Auth(_)
        ));
        assert!(matches!(
            SyncError::from_status(StatusCode::BAD_GATEWAY, ""),
            SyncError::Transient(_)
        ));
        assert!(matches!(
            SyncError::from_status(StatusCode::TOO_MANY_REQUESTS, "slow down"),
            SyncError::Transient(_)
        ));
    }
}
