use serde::Serialize;

use crate::authz::Action;

/// Failure reported by the hypervisor API (or the transport in front of it).
#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteError {
    #[error("{method} failed: {message}")]
    Call { method: String, message: String },
    #[error("no such object: {0}")]
    NoSuchObject(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl RemoteError {
    pub fn call(method: &str, message: impl Into<String>) -> Self {
        RemoteError::Call { method: method.to_string(), message: message.into() }
    }
}

/// Why an action (or one entity of an aggregation) did not go through.
///
/// Callers never see these directly: the HTTP layer degrades every variant to
/// a negative boolean or an omitted entity. They exist for logs and counters.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("{principal} may not {action} {target}")]
    Denied { principal: String, action: Action, target: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("incomplete data: {0}")]
    PartialData(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AuthorizationDenied,
    ResourceNotFound,
    RemoteCallFailure,
    PartialDataFailure,
}

impl ActionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ActionError::Denied { .. } => ErrorKind::AuthorizationDenied,
            ActionError::NotFound(_) => ErrorKind::ResourceNotFound,
            ActionError::Remote(_) => ErrorKind::RemoteCallFailure,
            ActionError::PartialData(_) => ErrorKind::PartialDataFailure,
        }
    }
}

impl From<crate::tokens::TokenError> for ActionError {
    fn from(e: crate::tokens::TokenError) -> Self {
        ActionError::NotFound(format!("action token: {e}"))
    }
}
