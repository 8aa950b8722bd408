//! Error type for the Azure adapters.

use thiserror::Error;

/// Errors raised while talking to Azure services.
///
/// Port-facing methods translate these into the domain error of the port
/// they implement ([`domain::PublishError`], [`domain::SecretError`]).
#[derive(Debug, Error)]
pub enum AzureError {
    /// A connection string is missing a required component or is malformed.
    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),

    /// An endpoint or namespace could not be turned into a URL.
    #[error("invalid endpoint '{0}'")]
    InvalidEndpoint(String),

    /// The identity endpoint did not return a usable token.
    #[error("token acquisition failed: {0}")]
    Token(String),

    /// The request never produced a response.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The requested resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The service answered with an unexpected status.
    #[error("{operation} failed with status {status}: {message}")]
    Status {
        /// Operation that was attempted.
        operation: &'static str,
        /// HTTP status returned.
        status: u16,
        /// Response body, truncated.
        message: String,
    },
}

/// Truncates a response body for inclusion in an error message.
pub(crate) fn snippet(body: &str) -> String {
    const MAX: usize = 256;
    if body.len() <= MAX {
        return body.to_owned();
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &body[..end])
}
