use serde::Serialize;
use uuid::Uuid;

use crate::Status;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition { id: Uuid, from: Status, to: Status },

    #[error("failed to spawn process: {0}")]
    Spawn(String),

    #[error("worker unreachable: {0}")]
    Forward(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Forward(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    InvalidTransition,
    Spawn,
    Forward,
    Io,
    Serialize,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Error::Spawn(_) => ErrorKind::Spawn,
            Error::Forward(_) => ErrorKind::Forward,
            Error::Io(_) => ErrorKind::Io,
            Error::Serialize(_) => ErrorKind::Serialize,
        }
    }

    pub(crate) fn job_not_found(id: &Uuid) -> Self {
        Error::NotFound(format!("no such job {id}"))
    }
}

/// Structured failure as returned to callers: a stable kind plus a
/// human-readable detail.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub detail: String,
}

impl From<&Error> for ErrorBody {
    fn from(err: &Error) -> Self {
        ErrorBody {
            kind: err.kind(),
            detail: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_carries_kind_and_detail() {
        let err = Error::InvalidInput("missing input".into());
        let body = ErrorBody::from(&err);
        assert_eq!(body.kind, ErrorKind::InvalidInput);
        assert_eq!(body.detail, "invalid input: missing input");

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["kind"], "invalid_input");
    }
}
