use std::future::Future;

use axum::{
    http::{header::HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::search::QueryError;
use crate::store::StoreError;
use crate::sync::{EntityError, RegistryError};
use crate::users::UserError;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    static REQUEST_ID: String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ValidationFailed,
    AuthInvalidCredentials,
    NotFound,
    StaleRevision,
    TransformConflict,
    AlreadySubscribed,
    NotSubscribed,
    StoreUnavailable,
    InternalError,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::AuthInvalidCredentials => "AUTH_INVALID_CREDENTIALS",
            Self::NotFound => "NOT_FOUND",
            Self::StaleRevision => "STALE_REVISION",
            Self::TransformConflict => "TRANSFORM_CONFLICT",
            Self::AlreadySubscribed => "ALREADY_SUBSCRIBED",
            Self::NotSubscribed => "NOT_SUBSCRIBED",
            Self::StoreUnavailable => "STORE_UNAVAILABLE",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub const fn status(self) -> StatusCode {
        match self {
            Self::ValidationFailed => StatusCode::BAD_REQUEST,
            Self::AuthInvalidCredentials => StatusCode::UNAUTHORIZED,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::StaleRevision => StatusCode::CONFLICT,
            Self::TransformConflict => StatusCode::UNPROCESSABLE_ENTITY,
            Self::AlreadySubscribed => StatusCode::CONFLICT,
            Self::NotSubscribed => StatusCode::BAD_REQUEST,
            Self::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub const fn retryable(self) -> bool {
        matches!(self, Self::StoreUnavailable | Self::InternalError)
    }

    pub const fn default_message(self) -> &'static str {
        match self {
            Self::ValidationFailed => "request validation failed",
            Self::AuthInvalidCredentials => "invalid user id or password",
            Self::NotFound => "requested resource not found",
            Self::StaleRevision => "revision is outside the card history",
            Self::TransformConflict => "change does not fit the card text",
            Self::AlreadySubscribed => "subscription already exists",
            Self::NotSubscribed => "no such subscription",
            Self::StoreUnavailable => "backing store is unavailable",
            Self::InternalError => "internal server error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayError {
    code: ErrorCode,
    message: String,
    details: Value,
    request_id: Option<String>,
}

impl RelayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), details: json!({}), request_id: None }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Text sent to a WebSocket client in an `ErrorRsp`.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for RelayError {}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let request_id = self.request_id.or_else(current_request_id);

        let mut response = (
            self.code.status(),
            Json(json!({
                "error": {
                    "code": self.code.as_str(),
                    "message": self.message,
                    "retryable": self.code.retryable(),
                    "request_id": request_id.clone(),
                    "details": self.details,
                }
            })),
        )
            .into_response();

        if let Some(request_id) = request_id {
            attach_request_id_header(&mut response, &request_id);
        }

        response
    }
}

impl From<StoreError> for RelayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => Self::new(ErrorCode::NotFound, err.to_string()),
            StoreError::Decode(_) => Self::new(ErrorCode::InternalError, err.to_string()),
            _ => Self::new(ErrorCode::StoreUnavailable, err.to_string()),
        }
    }
}

impl From<EntityError> for RelayError {
    fn from(err: EntityError) -> Self {
        let code = match &err {
            EntityError::StaleRevision { .. } => ErrorCode::StaleRevision,
            EntityError::Algebra(_) => ErrorCode::TransformConflict,
            EntityError::AlreadySubscribed { .. } => ErrorCode::AlreadySubscribed,
            EntityError::NotSubscribed { .. } => ErrorCode::NotSubscribed,
            EntityError::Stopped => ErrorCode::InternalError,
        };
        Self::new(code, err.to_string())
    }
}

impl From<RegistryError> for RelayError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Store(err) => err.into(),
            RegistryError::Entity(err) => err.into(),
            RegistryError::Stopped => Self::new(ErrorCode::InternalError, err.to_string()),
        }
    }
}

impl From<QueryError> for RelayError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::AlreadySubscribed { .. } => {
                Self::new(ErrorCode::AlreadySubscribed, err.to_string())
            }
            QueryError::Stopped => Self::new(ErrorCode::InternalError, err.to_string()),
        }
    }
}

impl From<UserError> for RelayError {
    fn from(err: UserError) -> Self {
        let code = match &err {
            UserError::InvalidCredentials { .. } => ErrorCode::AuthInvalidCredentials,
            UserError::Hash(_) | UserError::Store(_) => ErrorCode::InternalError,
        };
        Self::new(code, err.to_string())
    }
}

pub async fn with_request_id_scope<F>(request_id: String, future: F) -> F::Output
where
    F: Future,
{
    REQUEST_ID.scope(request_id, future).await
}

pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(Clone::clone).ok()
}

pub fn request_id_from_headers_or_generate(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub fn attach_request_id_header(response: &mut Response, request_id: &str) {
    if let Ok(header) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, header);
    }
}
