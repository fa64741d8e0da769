use std::collections::BTreeMap;

use axum::{
    Json,
    extract::{FromRequest, FromRequestParts, Path, Query, Request},
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
};
use serde::de::DeserializeOwned;
use tracing::{error, warn};

use axis_db::DbError;
use axis_types::api::ErrorBody;

/// Every failure a handler can return. Rendered as `{ "error", "details" }`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("authentication required")]
    Unauthorized,

    #[error("not allowed")]
    Forbidden,

    #[error("validation failed")]
    Validation(FieldErrors),

    #[error("malformed request: {0}")]
    BadRequest(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Conflict(String),

    /// A query that must not return partial data failed; the client gets an
    /// empty result set tagged with `code`.
    #[error("{code}")]
    EmptyResult {
        code: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<DbError>() {
            Some(DbError::NotFound(what)) => Self::NotFound(what),
            Some(DbError::Conflict(msg)) => Self::Conflict(msg.clone()),
            None => Self::Internal(err),
        }
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::Validation(_) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::EmptyResult { .. } | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Shorthand for a single-field validation failure.
    pub fn invalid(field: &str, message: impl Into<String>) -> Self {
        let mut errors = FieldErrors::default();
        errors.add(field, message);
        Self::Validation(errors)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match self {
            Self::Validation(fields) => ErrorBody {
                error: "validation failed".into(),
                details: Some(serde_json::json!(fields.0)),
            },
            Self::EmptyResult { code, source } => {
                error!("{}: {:#}", code, source);
                ErrorBody {
                    error: code.into(),
                    details: Some(serde_json::json!({ "results": [] })),
                }
            }
            Self::Internal(e) => {
                error!("Internal error: {:#}", e);
                ErrorBody {
                    error: "internal server error".into(),
                    details: None,
                }
            }
            other => ErrorBody {
                error: other.to_string(),
                details: None,
            },
        };
        (status, Json(body)).into_response()
    }
}

/// Field name -> problem, reported under `details` on a 400.
#[derive(Debug, Default)]
pub struct FieldErrors(pub BTreeMap<String, String>);

impl FieldErrors {
    pub fn add(&mut self, field: &str, message: impl Into<String>) {
        self.0.entry(field.to_string()).or_insert_with(|| message.into());
    }

    pub fn check(&mut self, ok: bool, field: &str, message: &str) {
        if !ok {
            self.add(field, message);
        }
    }

    pub fn into_result(self) -> Result<(), ApiError> {
        if self.0.is_empty() { Ok(()) } else { Err(ApiError::Validation(self)) }
    }
}

/// `Json<T>` whose rejection renders through the error envelope.
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => {
                warn!("Rejected request body: {}", rejection.body_text());
                Err(ApiError::BadRequest(rejection.body_text()))
            }
        }
    }
}

/// `Query<T>` whose rejection renders through the error envelope.
pub struct ApiQuery<T>(pub T);

impl<S, T> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Query::<T>::from_request_parts(parts, state).await {
            Ok(Query(value)) => Ok(Self(value)),
            Err(rejection) => {
                warn!("Rejected query string: {}", rejection.body_text());
                Err(ApiError::invalid("query", rejection.body_text()))
            }
        }
    }
}

/// `Path<T>` whose rejection renders through the error envelope.
pub struct ApiPath<T>(pub T);

impl<S, T> FromRequestParts<S> for ApiPath<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Path::<T>::from_request_parts(parts, state).await {
            Ok(Path(value)) => Ok(Self(value)),
            Err(rejection) => {
                warn!("Rejected path: {}", rejection.body_text());
                Err(ApiError::invalid("path", rejection.body_text()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_taxonomy() {
        assert_eq!(ApiError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::invalid("content", "required").status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::NotFound("room").status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::Conflict("taken".into()).status(), StatusCode::CONFLICT);
        assert_eq!(
            ApiError::Internal(anyhow::anyhow!("disk full")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn db_markers_keep_their_status() {
        let conflict: ApiError = anyhow::Error::from(DbError::Conflict("username already exists".into())).into();
        assert_eq!(conflict.status(), StatusCode::CONFLICT);
        let other: ApiError = anyhow::anyhow!("locked").into();
        assert!(matches!(other, ApiError::Internal(_)));
    }

    #[test]
    fn first_problem_per_field_wins() {
        let mut errors = FieldErrors::default();
        errors.check(false, "name", "too long");
        errors.check(false, "name", "empty");
        errors.check(true, "kind", "unused");
        assert_eq!(errors.0.len(), 1);
        assert_eq!(errors.0["name"], "too long");
    }
}
