//! Crate-wide error taxonomy.
//!
//! Xolo workflows never invent ad hoc error strings the way the teacher's
//! `StateError`/`ReleaseError` pairs do per-module; every failure that can
//! cross a workflow boundary collapses into the single [`XoloError`]
//! taxonomy so the HTTP layer has one place to map errors to status codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::catalog::CatalogError;
use crate::fleet::FleetError;

/// The error taxonomy described in spec §7.
///
/// Each variant corresponds to a class of failure, not a specific cause —
/// callers attach context via the `String` payload rather than growing new
/// variants per call site.
#[derive(Debug, Error)]
pub enum XoloError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("locked: {0}")]
    Locked(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("missing data: {0}")]
    MissingData(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,
}

impl XoloError {
    /// `true` for failures that represent an *unexpected* upstream problem
    /// (as opposed to a routine NotFound/Conflict) and therefore warrant the
    /// `alert`-level log event called for in spec §4.7/§4.9.
    pub fn is_unexpected_upstream(&self) -> bool {
        matches!(self, XoloError::Unavailable(_) | XoloError::Timeout(_))
    }

    fn status(&self) -> StatusCode {
        match self {
            XoloError::NotFound(_) => StatusCode::NOT_FOUND,
            XoloError::AlreadyExists(_) => StatusCode::CONFLICT,
            XoloError::Locked(_) => StatusCode::CONFLICT,
            XoloError::InvalidData(_) => StatusCode::BAD_REQUEST,
            XoloError::MissingData(_) => StatusCode::BAD_REQUEST,
            XoloError::Unsupported(_) => StatusCode::BAD_REQUEST,
            XoloError::Unauthorized => StatusCode::UNAUTHORIZED,
            XoloError::Forbidden => StatusCode::FORBIDDEN,
            XoloError::Unavailable(_) => StatusCode::BAD_GATEWAY,
            XoloError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            XoloError::Server(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    status: u16,
    error: String,
}

impl IntoResponse for XoloError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            status: status.as_u16(),
            error: self.to_string(),
        };
        (status, axum::Json(body)).into_response()
    }
}

impl From<CatalogError> for XoloError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::NotFound(m) => XoloError::NotFound(m),
            CatalogError::Conflict(m) => XoloError::AlreadyExists(m),
            CatalogError::Unavailable(m) => XoloError::Unavailable(m),
        }
    }
}

impl From<FleetError> for XoloError {
    fn from(err: FleetError) -> Self {
        match err {
            FleetError::NotFound(m) => XoloError::NotFound(m),
            FleetError::Conflict(m) => XoloError::AlreadyExists(m),
            FleetError::Unavailable(m) => XoloError::Unavailable(m),
        }
    }
}

impl From<std::io::Error> for XoloError {
    fn from(err: std::io::Error) -> Self {
        XoloError::Server(format!("io error: {err}"))
    }
}

impl From<serde_json::Error> for XoloError {
    fn from(err: serde_json::Error) -> Self {
        XoloError::Server(format!("serde error: {err}"))
    }
}

/// Convenience alias used throughout the crate in place of the teacher's
/// boxed-trait-object `Res<T>` — the taxonomy above is closed, so a concrete
/// error type is strictly more useful to callers than `Box<dyn Error>`.
pub type Res<T> = std::result::Result<T, XoloError>;
