//! Error types for HTTP/1.1 response decoding.

/// Error type for response decoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// Status line was not `HTTP/1.x <code> [reason]`.
    #[error("invalid status line")]
    InvalidStatusLine,

    /// A header line had no `:` separator or was not valid UTF-8.
    #[error("invalid header line")]
    InvalidHeader,

    /// `content-length` was not a decimal integer, or repeated with
    /// conflicting values.
    #[error("invalid content-length: {0}")]
    InvalidContentLength(String),

    /// A chunk size line was not valid hexadecimal.
    #[error("invalid chunk size")]
    InvalidChunkSize,

    /// Chunk data was not followed by CRLF.
    #[error("missing CRLF after chunk data")]
    MissingChunkTerminator,

    /// Response head exceeded the configured size limit.
    #[error("response head exceeds {0} bytes")]
    HeadTooLarge(usize),

    /// The peer closed the connection before the message was complete.
    #[error("connection closed before end of message")]
    UnexpectedEof,
}
