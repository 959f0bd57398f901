//! Error types.

use std::io;
use thiserror::Error;

/// Raised at registration time when a stub cannot be served as declared.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// Declared `Content-Length` disagrees with the static body.
    #[error(
        "inconsistent parameters: the Content-Length header you registered expects size \"{declared}\" \
         but the body you registered for that has actually length \"{actual}\""
    )]
    ContentLengthMismatch { declared: usize, actual: usize },

    /// Declared `Content-Length` is not a number.
    #[error("the Content-Length header \"{0}\" is not a number")]
    InvalidContentLength(String),

    /// Literal URI could not be parsed.
    #[error("invalid uri `{uri}`: {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("invalid uri pattern: {0}")]
    InvalidRegex(#[from] regex::Error),

    /// A registration must carry at least one response.
    #[error("registration has no responses")]
    NoResponses,
}

/// No matcher resolved the request and real network access is disallowed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "no mock registered for {method} {url} (host: {host}, protocol: {protocol}) \
     and real network connections are not allowed"
)]
pub struct UnmockedError {
    pub method: String,
    pub host: String,
    pub protocol: String,
    pub url: String,
}

/// Malformed request bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("request line is missing")]
    MissingRequestLine,

    #[error("invalid request line: {0:?}")]
    InvalidRequestLine(String),

    #[error("invalid header line: {0:?}")]
    InvalidHeader(String),

    #[error("invalid Content-Length: {0:?}")]
    InvalidContentLength(String),

    #[error("invalid chunk size line: {0:?}")]
    InvalidChunkSize(String),

    #[error("chunk data is not terminated by CRLF")]
    UnterminatedChunk,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Unmocked(#[from] UnmockedError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<UnmockedError> for io::Error {
    fn from(err: UnmockedError) -> Self {
        io::Error::new(io::ErrorKind::Other, err)
    }
}

/// Recover the [`UnmockedError`] carried by an I/O error from an intercepted stream.
pub fn unmocked(err: &io::Error) -> Option<&UnmockedError> {
    err.get_ref()?.downcast_ref::<UnmockedError>()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn github() -> UnmockedError {
        UnmockedError {
            method: "GET".to_string(),
            host: "github.com".to_string(),
            protocol: "https".to_string(),
            url: "https://github.com/some/path".to_string(),
        }
    }

    #[test]
    fn test_unmocked_message_names_url() {
        let msg = github().to_string();
        assert!(msg.contains("https://github.com/some/path"));
        assert!(msg.contains("github.com"));
    }

    #[test]
    fn test_unmocked_survives_io_wrapping() {
        let io_err: io::Error = github().into();
        assert_eq!(io_err.kind(), io::ErrorKind::Other);

        let recovered = unmocked(&io_err).unwrap();
        assert_eq!(recovered.host, "github.com");
        assert_eq!(recovered.protocol, "https");

        let plain = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert!(unmocked(&plain).is_none());
    }

    #[test]
    fn test_content_length_mismatch_message() {
        let err = ConfigurationError::ContentLengthMismatch {
            declared: 999,
            actual: 10,
        };
        assert!(err.to_string().contains("\"999\""));
        assert!(err.to_string().contains("\"10\""));
    }
}
