//! Invocation outcomes: the structured response delivered to the caller and
//! the error categories that can end an invocation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// InvocationError
// ---------------------------------------------------------------------------

/// Every way an invocation can fail, each mapped to an HTTP-style status code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvocationError {
    #[error("{0}")]
    ServiceUnavailable(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("operation not found: {0}")]
    NotFound(String),
    #[error("invocation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("too many concurrent invocations")]
    Overloaded,
    #[error("handler {handler} failed: {message}")]
    HandlerFault { handler: String, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    /// Failure reported by the business operation itself.
    #[error("{message}")]
    Producer { status: u16, message: String },
}

impl InvocationError {
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::ServiceUnavailable(_) | Self::Overloaded => 503,
            Self::BadRequest(_) => 400,
            Self::NotFound(_) => 404,
            Self::Timeout { .. } => 408,
            Self::HandlerFault { .. } => 500,
            Self::Transport(_) => 502,
            Self::Producer { status, .. } => *status,
        }
    }

    /// Rebuilds an error from its wire form. The category is recovered from
    /// the status code; the message is kept verbatim.
    #[must_use]
    pub fn from_body(body: &ErrorBody) -> Self {
        match body.code {
            503 => Self::ServiceUnavailable(body.message.clone()),
            400 => Self::BadRequest(body.message.clone()),
            404 => Self::NotFound(body.message.clone()),
            code => Self::Producer {
                status: code,
                message: body.message.clone(),
            },
        }
    }
}

/// Wire form of a failed invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: u16,
    pub message: String,
}

impl From<&InvocationError> for ErrorBody {
    fn from(err: &InvocationError) -> Self {
        Self {
            code: err.status_code(),
            message: err.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// The single outcome delivered for an invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    status: u16,
    result: Result<Value, InvocationError>,
}

impl Response {
    #[must_use]
    pub fn ok(value: Value) -> Self {
        Self {
            status: 200,
            result: Ok(value),
        }
    }

    #[must_use]
    pub fn fail(error: InvocationError) -> Self {
        Self {
            status: error.status_code(),
            result: Err(error),
        }
    }

    #[must_use]
    pub fn from_result(result: Result<Value, InvocationError>) -> Self {
        match result {
            Ok(value) => Self::ok(value),
            Err(error) => Self::fail(error),
        }
    }

    #[must_use]
    pub fn status(&self) -> u16 {
        self.status
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    #[must_use]
    pub fn result(&self) -> &Result<Value, InvocationError> {
        &self.result
    }

    /// Returns the error body when the response is a failure.
    #[must_use]
    pub fn error_body(&self) -> Option<ErrorBody> {
        self.result.as_ref().err().map(ErrorBody::from)
    }

    /// Consumes the response, yielding the payload or the error.
    ///
    /// # Errors
    ///
    /// Returns the invocation error if the response is a failure.
    pub fn into_result(self) -> Result<Value, InvocationError> {
        self.result
    }
}
