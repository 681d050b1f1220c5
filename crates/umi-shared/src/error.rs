use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("Empty frame")]
    Empty,

    #[error("Unknown STOMP command: {0}")]
    UnknownCommand(String),

    #[error("Malformed header line: {0}")]
    MalformedHeader(String),

    #[error("Invalid escape sequence in header: {0}")]
    InvalidEscape(String),

    #[error("Missing blank line after headers")]
    MissingBody,

    #[error("Invalid content-length: {0}")]
    InvalidContentLength(String),

    #[error("Frame body is not valid UTF-8")]
    InvalidUtf8,
}

#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("Invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}
