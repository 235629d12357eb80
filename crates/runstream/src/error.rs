//! Client error types

use thiserror::Error;

/// Client error type
#[derive(Error, Debug)]
pub enum ClientError {
    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// URL parse error
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-2xx API response
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },
}

/// Client result type
pub type Result<T> = std::result::Result<T, ClientError>;
