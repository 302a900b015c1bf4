//! Ledger error model.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

use crate::schemas::Amount;

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Coarse classification used by callers to decide whether to retry,
/// surface, or treat a failure as a no-op.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Authorization,
    InvariantViolation,
    Internal,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("amount must be between 1 and {} minor units", crate::schemas::MAX_AMOUNT)]
    InvalidAmount,

    #[error("an expense needs at least one participant")]
    EmptyParticipants,

    #[error("participant {0} listed more than once")]
    DuplicateParticipant(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("user {0} is not a member of the group")]
    UnknownMember(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("split is already settled")]
    AlreadySettled,

    #[error("{entity} {id} already exists")]
    AlreadyExists { entity: &'static str, id: String },

    #[error("requester is not allowed to perform this operation")]
    Forbidden,

    #[error("missing or invalid session token")]
    Unauthenticated,

    #[error("outstanding balance of {net} must be cleared first")]
    OutstandingBalance { net: Amount },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl LedgerError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn already_exists(entity: &'static str, id: impl ToString) -> Self {
        Self::AlreadyExists {
            entity,
            id: id.to_string(),
        }
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidAmount
            | Self::EmptyParticipants
            | Self::DuplicateParticipant(_)
            | Self::InvalidRequest(_)
            | Self::UnknownMember(_) => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::AlreadySettled | Self::AlreadyExists { .. } | Self::Conflict(_) => {
                ErrorKind::Conflict
            }
            Self::Forbidden | Self::Unauthenticated => ErrorKind::Authorization,
            Self::OutstandingBalance { .. } => ErrorKind::InvariantViolation,
            Self::Storage(_) => ErrorKind::Internal,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::InvalidAmount => "invalid_amount",
            Self::EmptyParticipants => "empty_participants",
            Self::DuplicateParticipant(_) => "duplicate_participant",
            Self::InvalidRequest(_) => "invalid_request",
            Self::UnknownMember(_) => "unknown_member",
            Self::NotFound { .. } => "not_found",
            Self::AlreadySettled => "already_settled",
            Self::AlreadyExists { .. } => "already_exists",
            Self::Forbidden => "forbidden",
            Self::Unauthenticated => "unauthenticated",
            Self::OutstandingBalance { .. } => "outstanding_balance",
            Self::Conflict(_) => "conflict",
            Self::Storage(_) => "storage",
        }
    }
}

impl From<mongodb::error::Error> for LedgerError {
    fn from(err: mongodb::error::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl ResponseError for LedgerError {
    fn status_code(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Authorization if *self == Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrorKind::Authorization => StatusCode::FORBIDDEN,
            ErrorKind::InvariantViolation => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": self.code(),
            "message": self.to_string(),
        }))
    }
}
