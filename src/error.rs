// src/error.rs

use thiserror::Error;

use crate::broker::BrokerError;
use crate::flow::FlowStatus;

/// Coarse classification the calling boundary maps to a response
/// (e.g. an HTTP status).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    BadRequest,
    Unavailable,
    Internal,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store conflict: {0}")]
    Conflict(String),
    #[error("store backend failure: {0}")]
    Backend(String),
}

/// Every failure the engine surfaces to its callers. Nothing is recovered
/// locally; a missing route is not an error and never shows up here.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("flow `{0}` not found")]
    FlowNotFound(String),

    #[error("{0}")]
    FlowStateConflict(String),

    #[error("flow `{flow_id}` is {status} and does not accept leads")]
    FlowInactive { flow_id: String, status: FlowStatus },

    #[error("lead `{0}` not found")]
    LeadNotFound(String),

    #[error("broker unavailable: {0}")]
    BrokerUnavailable(#[from] BrokerError),

    #[error("validation failed: {0}")]
    ValidationError(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::ValidationError(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::FlowNotFound(_) | EngineError::LeadNotFound(_) => ErrorKind::NotFound,
            EngineError::FlowStateConflict(_) => ErrorKind::Conflict,
            EngineError::Store(StoreError::Conflict(_)) => ErrorKind::Conflict,
            EngineError::FlowInactive { .. } | EngineError::ValidationError(_) => ErrorKind::BadRequest,
            EngineError::BrokerUnavailable(_) => ErrorKind::Unavailable,
            EngineError::Store(StoreError::Backend(_)) => ErrorKind::Internal,
        }
    }
}
