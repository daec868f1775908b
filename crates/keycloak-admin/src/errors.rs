use http::StatusCode;
use shared::error::CommonError;
use thiserror::Error;
use url::Url;

/// Message extracted from a Keycloak error body.
///
/// Keycloak answers with `{"errorMessage": ...}` from the admin API and
/// `{"error": ..., "error_description": ...}` from the token endpoint; some
/// failures have an empty body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiErrorBody {
    pub message: String,
}

impl ApiErrorBody {
    pub fn from_raw(raw: &str) -> Self {
        let parsed = serde_json::from_str::<serde_json::Value>(raw).ok();
        let field = |name: &str| {
            parsed
                .as_ref()
                .and_then(|v| v.get(name))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };

        let message = field("errorMessage")
            .or_else(|| field("error_description"))
            .or_else(|| field("error"))
            .unwrap_or_else(|| raw.trim().to_string());

        Self { message }
    }
}

impl std::fmt::Display for ApiErrorBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "<empty body>")
        } else {
            write!(f, "{}", self.message)
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiError {
    pub http_status_code: StatusCode,
    pub url: Url,
    pub body: ApiErrorBody,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (http status code {} at '{}')",
            self.body, self.http_status_code, self.url
        )
    }
}

impl std::error::Error for ApiError {}

#[derive(Error, Debug)]
pub enum AdminApiError {
    #[error("resource not found: {0}")]
    NotFound(Box<ApiError>),
    #[error("resource already exists: {0}")]
    Conflict(Box<ApiError>),
    #[error("not authorized against the identity provider: {0}")]
    Unauthorized(Box<ApiError>),
    // boxed because ApiError can get large with big bodies
    #[error("identity provider request failed: {0}")]
    Remote(Box<ApiError>),
    #[error("(Protocol error) {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("network error talking to the identity provider")]
    Network(#[from] reqwest::Error),
    #[error("invalid identity provider url: {0}")]
    InvalidUrl(String),
}

impl AdminApiError {
    /// Classify a non-success response
    pub fn from_api_error(error: ApiError) -> Self {
        match error.http_status_code {
            StatusCode::NOT_FOUND => AdminApiError::NotFound(Box::new(error)),
            StatusCode::CONFLICT => AdminApiError::Conflict(Box::new(error)),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                AdminApiError::Unauthorized(Box::new(error))
            }
            _ => AdminApiError::Remote(Box::new(error)),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AdminApiError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, AdminApiError::Conflict(_))
    }

    /// Whether a caller could reasonably retry the same request.
    /// Transport failures and 5xx/429 answers are transient, everything else
    /// needs an operator.
    pub fn is_retryable(&self) -> bool {
        match self {
            AdminApiError::Network(e) => e.is_timeout() || e.is_connect(),
            AdminApiError::Remote(e) => {
                e.http_status_code.is_server_error()
                    || e.http_status_code == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }
}

impl From<AdminApiError> for CommonError {
    fn from(e: AdminApiError) -> Self {
        let msg = e.to_string();
        match e {
            AdminApiError::NotFound(_) => CommonError::NotFound {
                msg,
                lookup_id: String::new(),
                source: Some(e.into()),
            },
            AdminApiError::Unauthorized(_) => CommonError::Authorization {
                msg,
                source: Some(e.into()),
            },
            AdminApiError::Serialization(_) => CommonError::InvalidResponse {
                msg,
                source: Some(e.into()),
            },
            other => CommonError::Unknown(other.into()),
        }
    }
}
