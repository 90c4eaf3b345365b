use std::any::Any;
use std::io;

/// Best-effort extraction of the message from a caught panic payload.
///
/// Panics raised through `panic!` carry a `String` or `&str`; anything else
/// has no text to recover.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> Option<String> {
    if let Some(message) = payload.downcast_ref::<String>() {
        return Some(message.clone());
    }
    payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
}

/// A fault on the underlying web server connection.
///
/// These are fatal to the whole connection: every live session on it is
/// aborted and the connection is closed.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o failure on the web server connection")]
    Io(#[from] io::Error),
    #[error("the web server connection closed in the middle of a record")]
    TruncatedRecord,
    #[error("unsupported FastCGI protocol version: '{0}'")]
    UnsupportedVersion(u8),
}

/// Why a session's input streams stopped accepting reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AbortReason {
    /// The web server aborted the request, or the request was cancelled.
    #[error("the request was aborted")]
    SessionAborted,
    /// The connection carrying the request failed.
    #[error("the web server connection failed")]
    TransportFailed,
}

impl From<AbortReason> for io::Error {
    fn from(reason: AbortReason) -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionAborted, reason)
    }
}

/// A misuse of the response surface by the application.
///
/// These never disturb the connection. They are raised back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OutputError {
    #[error("the response header was already sent")]
    HeaderSent,
    #[error("status code '{0}' is outside the range 100..600")]
    InvalidStatus(u16),
    #[error("'{0}' is not a valid response field name")]
    InvalidFieldName(String),
    #[error("'{0}' is a reserved response field name")]
    ReservedField(String),
    #[error("the output buffer size can only be changed before the first write")]
    BufferPinned,
    #[error("exit codes must be non-negative, got '{0}'")]
    InvalidExitCode(i32),
    #[error("the response output is closed")]
    Closed,
}

impl From<OutputError> for io::Error {
    fn from(error: OutputError) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidInput, error)
    }
}

/// The error type application handlers return.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The application is out of some resource and wants the web server to
    /// retry elsewhere. Reported as `OVERLOADED`.
    #[error("the application is overloaded")]
    Overloaded,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Output(#[from] OutputError),
    /// Any other application failure.
    #[error("{0}")]
    Failed(String),
}

/// A rejected engine configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("'{0}' must be greater than zero when set")]
    ZeroLimit(&'static str),
    #[error("'{0}' must be greater than zero")]
    ZeroSize(&'static str),
}

/// Why the engine failed to start.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] io::Error),
}
