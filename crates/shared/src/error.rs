use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Serialize)]
pub enum CommonError {
    #[error("caller is not authorized to perform this action: {msg}")]
    Authorization {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("could not find resource: {msg}")]
    NotFound {
        msg: String,
        lookup_id: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("unknown error")]
    Unknown(
        #[serde(skip)]
        #[from]
        anyhow::Error,
    ),
    #[error("invalid request: {msg}")]
    InvalidRequest {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("invalid response: {msg}")]
    InvalidResponse {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("repository error: {msg}")]
    Repository {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("sqlite database error")]
    SqliteError {
        #[serde(skip)]
        #[from]
        #[source]
        source: libsql::Error,
    },
    #[error("io error")]
    IoError {
        #[serde(skip)]
        #[from]
        #[source]
        source: std::io::Error,
    },
}

impl CommonError {
    /// Wrap any error raised by a storage backend into [`CommonError::Repository`].
    pub fn repository(msg: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        CommonError::Repository {
            msg: msg.into(),
            source: Some(source.into()),
        }
    }

    pub fn not_found(msg: impl Into<String>, lookup_id: impl Into<String>) -> Self {
        CommonError::NotFound {
            msg: msg.into(),
            lookup_id: lookup_id.into(),
            source: None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CommonError::NotFound { .. })
    }
}
