use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable RES protocol error codes.
pub mod codes {
    pub const ACCESS_DENIED: &str = "system.accessDenied";
    pub const INTERNAL_ERROR: &str = "system.internalError";
    pub const INVALID_PARAMS: &str = "system.invalidParams";
    pub const INVALID_QUERY: &str = "system.invalidQuery";
    pub const METHOD_NOT_FOUND: &str = "system.methodNotFound";
    pub const NOT_FOUND: &str = "system.notFound";
    pub const TIMEOUT: &str = "system.timeout";
}

/// A RES protocol error.
///
/// This is a wire value, not a library failure: handlers reply with it,
/// either explicitly through a request's `error` method or by returning it
/// and letting the framework send it. Custom codes are propagated untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Error {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Error {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Error {
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }

    /// Attaches additional error data included in the reply.
    pub fn with_data(mut self, data: impl Serialize) -> Self {
        self.data = serde_json::to_value(data).ok();
        self
    }

    pub fn access_denied() -> Self {
        Error::new(codes::ACCESS_DENIED, "Access denied")
    }

    pub fn internal_error() -> Self {
        Error::new(codes::INTERNAL_ERROR, "Internal error")
    }

    pub fn invalid_params() -> Self {
        Error::new(codes::INVALID_PARAMS, "Invalid parameters")
    }

    pub fn invalid_query() -> Self {
        Error::new(codes::INVALID_QUERY, "Invalid query")
    }

    pub fn method_not_found() -> Self {
        Error::new(codes::METHOD_NOT_FOUND, "Method not found")
    }

    pub fn not_found() -> Self {
        Error::new(codes::NOT_FOUND, "Not found")
    }

    pub fn timeout() -> Self {
        Error::new(codes::TIMEOUT, "Request timed out")
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for Error {}

/// Failure of the underlying broker connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    #[error("connection closed")]
    Closed,
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("{0}")]
    Other(String),
}

/// Failure reported by the service lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("service already started")]
    AlreadyStarted,
    #[error("service not started")]
    NotStarted,
    #[error("invalid resource ID: {0}")]
    InvalidResourceId(String),
    #[error("no handler matching {0}")]
    NoMatchingHandler(String),
    #[error("event listeners attached to patterns without handlers: {}", .0.join(", "))]
    InvalidListeners(Vec<String>),
    #[error(transparent)]
    Conn(#[from] ConnError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predefined_errors_carry_stable_codes() {
        assert_eq!(Error::access_denied().code, "system.accessDenied");
        assert_eq!(Error::access_denied().message, "Access denied");
        assert_eq!(Error::not_found().code, "system.notFound");
        assert_eq!(Error::method_not_found().message, "Method not found");
        assert_eq!(Error::timeout().message, "Request timed out");
    }

    #[test]
    fn serialized_error_omits_absent_data() {
        let json = serde_json::to_value(Error::not_found()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"code": "system.notFound", "message": "Not found"})
        );
    }

    #[test]
    fn serialized_error_includes_data() {
        let err = Error::new("test.custom", "Custom").with_data(serde_json::json!({"k": 1}));
        let json = serde_json::to_value(err).unwrap();
        assert_eq!(json["data"]["k"], 1);
    }
}
