//! Failure taxonomy for the gateway.
//!
//! Every fallible path maps to exactly one of these kinds, so callers can
//! branch on `code()` instead of string-matching messages. Diagnostic detail
//! (URLs, status codes, raw fragments) goes to the log; the `Display` message
//! stays short.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Requested package does not exist upstream (HTTP 404).
    #[error("package not found: {name}")]
    NotFound { name: String },

    /// Upstream responded with a non-404 error status.
    #[error("registry request failed with HTTP {status}")]
    Upstream { status: u16 },

    /// The request never reached upstream, or no response came back.
    #[error("no response from registry: {message}")]
    NoResponse { message: String },

    /// Failure before the request was even dispatched.
    #[error("failed to set up registry request: {message}")]
    RequestSetup { message: String },

    /// Required local lockfile is missing. Fatal, not retried.
    #[error("package-lock.json not found in {dir}; run `npm install` to generate it first")]
    MissingLockfile { dir: String },

    /// External command could not run, or failed with no usable output.
    #[error("failed to run `{command}`: {message}")]
    Subprocess { command: String, message: String },

    /// JSON parse failure on registry, audit, or fix-simulation output.
    /// The message carries a bounded excerpt of the raw output.
    #[error("malformed {origin} output: {message}")]
    Malformed {
        origin: &'static str,
        message: String,
    },

    /// Argument failed a shape constraint before any work started.
    #[error("{message}")]
    Validation { message: String },
}

impl GatewayError {
    /// Machine-readable kind code, stable across message wording changes.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::NotFound { .. } => "NOT_FOUND",
            GatewayError::Upstream { .. } => "UPSTREAM_ERROR",
            GatewayError::NoResponse { .. } => "NO_RESPONSE",
            GatewayError::RequestSetup { .. } => "REQUEST_SETUP",
            GatewayError::MissingLockfile { .. } => "PRECONDITION_FAILED",
            GatewayError::Subprocess { .. } => "SUBPROCESS_FAILED",
            GatewayError::Malformed { .. } => "MALFORMED_OUTPUT",
            GatewayError::Validation { .. } => "VALIDATION",
        }
    }

    /// HTTP status associated with the failure, where one exists.
    pub fn status(&self) -> Option<u16> {
        match self {
            GatewayError::NotFound { .. } => Some(404),
            GatewayError::Upstream { status } => Some(*status),
            _ => None,
        }
    }
}
