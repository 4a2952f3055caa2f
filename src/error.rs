//! Error types for the request workflow.

use thiserror::Error;

use crate::domain::request::RequestId;

/// Result type alias using the beamcheck error type.
pub type Result<T> = std::result::Result<T, BeamcheckError>;

/// Main error type for the request workflow.
///
/// Guard, validation and not-found failures never mutate state. Dispatch
/// failures are deliberately absent: they are logged by the dispatcher and
/// never reach the actor that triggered the completion.
#[derive(Error, Debug)]
pub enum BeamcheckError {
    /// Actor or shared-secret guard not satisfied
    #[error("Not authorized: {0}")]
    Unauthorized(String),

    /// Malformed transition input (empty cart, missing item fields, bad result payload)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Request not found (or deleted)
    #[error("Request not found: {0}")]
    RequestNotFound(RequestId),

    /// Path identifier and payload identifier disagree
    #[error("Request id mismatch: path {path}, payload {payload}")]
    IdMismatch {
        path: RequestId,
        payload: RequestId,
    },

    /// Request is in an invalid state for the requested operation
    #[error("Invalid state transition: request {0} is in state '{1}', expected '{2}'")]
    InvalidState(RequestId, String, String),

    /// A result was presented for a completion that has since been superseded
    #[error("Stale result for request {request_id}: generation {presented}, current {current}")]
    StaleGeneration {
        request_id: RequestId,
        presented: u64,
        current: u64,
    },

    /// Dispatcher is shutting down and no longer accepts work
    #[error("Dispatcher is shutting down")]
    Shutdown,

    /// HTTP client error
    #[error("HTTP request failed: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BeamcheckError {
    /// True for failures caused by the caller's input or identity, as opposed
    /// to infrastructure trouble.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            BeamcheckError::Unauthorized(_)
                | BeamcheckError::Validation(_)
                | BeamcheckError::RequestNotFound(_)
                | BeamcheckError::IdMismatch { .. }
                | BeamcheckError::InvalidState(..)
                | BeamcheckError::StaleGeneration { .. }
        )
    }
}
