use std::time::Duration;

use thiserror::Error;

/// Ways a web seed can fail a connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WebSeedError {
    /// The server refused the request; try again after `retry_after`.
    #[error("server returned {status}, retry in {}s", retry_after.as_secs())]
    ServiceUnavailable { status: u16, retry_after: Duration },

    #[error("redirect without a location")]
    MissingLocation,

    /// A redirect for a multi-file seed that does not end in the file path.
    #[error("invalid redirection to {0}")]
    InvalidRedirection(String),

    #[error("response has no content length")]
    NoContentLength,

    #[error("invalid content range")]
    InvalidRange,

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// The seed moved; the new location has been registered.
    #[error("redirecting to {0}")]
    Redirecting(String),

    #[error("response without an outstanding request")]
    UnexpectedResponse,
}

impl WebSeedError {
    /// Whether the seed should be dropped from the torrent for good.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            WebSeedError::MissingLocation
                | WebSeedError::InvalidRedirection(_)
                | WebSeedError::NoContentLength
                | WebSeedError::InvalidRange
                | WebSeedError::InvalidUrl(_)
        )
    }
}
