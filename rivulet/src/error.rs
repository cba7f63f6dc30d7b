use std::fmt;
use std::io;

use thiserror::Error;

/// Errors returned synchronously by engine, factory, and stream handle calls.
#[derive(Debug, Error)]
pub enum Error {
    /// The call was made outside the engine's running window.
    #[error("engine is not running")]
    EngineNotRunning,
    /// `start()` was called on an engine that was already started.
    #[error("engine already started")]
    AlreadyStarted,
    /// `join()` was called before `terminate()`.
    #[error("engine has not been terminated")]
    NotTerminated,
    /// The engine thread panicked; the engine instance is unusable.
    #[error("engine thread panicked")]
    EngineThreadPanicked,
    /// A stream handle call broke the stream's usage contract.
    #[error("invalid stream operation: {0}")]
    InvalidStreamOperation(&'static str),
    /// The request authority could not be parsed into host and port.
    #[error("invalid authority: {0}")]
    InvalidAuthority(String),
    /// Configuration failed validation.
    #[error("config: {0}")]
    Config(String),
    /// Spawning the engine thread failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Failure class of a stream that ended in the `Errored` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    DnsFailure,
    ConnectFailure,
    TlsHandshakeFailure,
    MidStreamProtocolError,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorCode::DnsFailure => "dns failure",
            ErrorCode::ConnectFailure => "connect failure",
            ErrorCode::TlsHandshakeFailure => "tls handshake failure",
            ErrorCode::MidStreamProtocolError => "mid-stream protocol error",
        })
    }
}

/// Error payload delivered with [`StreamEvent::Error`](crate::StreamEvent::Error).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct StreamError {
    pub code: ErrorCode,
    pub message: String,
    pub attempt_count: u32,
}

impl StreamError {
    pub(crate) fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        StreamError {
            code,
            message: message.into(),
            attempt_count: 0,
        }
    }
}

/// Why a stream was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelReason {
    /// The consumer called `cancel()`.
    Consumer,
    /// The engine was terminated with the stream in flight.
    EngineShutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_error_display() {
        let err = StreamError::new(ErrorCode::ConnectFailure, "connection refused");
        assert_eq!(err.to_string(), "connect failure: connection refused");
    }

    #[test]
    fn error_display() {
        assert_eq!(Error::EngineNotRunning.to_string(), "engine is not running");
        assert_eq!(
            Error::InvalidStreamOperation("headers already sent").to_string(),
            "invalid stream operation: headers already sent"
        );
        assert_eq!(
            Error::InvalidAuthority("[::1".to_string()).to_string(),
            "invalid authority: [::1"
        );
    }
}
