//! Download error taxonomy
//!
//! Every failure surfaced by the engine maps onto one of these variants so
//! callers can distinguish user action, server behavior and plain I/O.

use thiserror::Error;

/// Errors produced by the download engine.
#[derive(Error, Debug)]
pub enum DownloadError {
    /// Malformed input from the caller (empty URL list, unparseable URL).
    #[error("invalid input: {0}")]
    DataInvalid(String),

    /// Internal abort: file locked, no unfinished chunks, assembler closed.
    #[error("canceled: {0}")]
    ProcessCanceled(String),

    /// Explicit user action or a rejected collision prompt.
    #[error("canceled by user")]
    UserCanceled,

    /// Non-redirect response with status >= 300.
    #[error("HTTP {status} ({status_text}) from {url}")]
    HttpError {
        status: u16,
        status_text: String,
        url: String,
    },

    /// Server answered with an HTML body, most likely a login or error page.
    #[error("server returned a html page instead of the file: {0}")]
    DownloadIsHtml(String),

    /// Collision with `RedownloadMode::Never`.
    #[error("file was already downloaded: {0}")]
    AlreadyDownloaded(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DownloadError {
    /// True for errors a worker may retry mid-flight once progress was seen.
    pub fn is_transient(&self) -> bool {
        match self {
            DownloadError::Network(err) => {
                err.is_timeout() || err.is_connect() || err.is_body() || err.is_request()
            }
            _ => false,
        }
    }
}

pub type DownloadResult<T> = Result<T, DownloadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_error_display() {
        let err = DownloadError::HttpError {
            status: 503,
            status_text: "Service Unavailable".to_string(),
            url: "https://example.com/file.zip".to_string(),
        };
        assert_eq!(
            format!("{}", err),
            "HTTP 503 (Service Unavailable) from https://example.com/file.zip"
        );
    }

    #[test]
    fn test_non_network_errors_are_not_transient() {
        assert!(!DownloadError::UserCanceled.is_transient());
        assert!(!DownloadError::DataInvalid("x".to_string()).is_transient());
        assert!(!DownloadError::DownloadIsHtml("u".to_string()).is_transient());
    }
}
