//! Error taxonomy shared by the hub servers, the clients, and the offline
//! validator.

use thiserror::Error;

/// Result alias for operations that fail with a [`SyncError`].
pub type SyncResult<T> = Result<T, SyncError>;

/// Everything that can go wrong between a device and the hub, or while
/// validating a recorded session.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Bad frame or JSON payload.
    #[error("Invalid JSON: {0}")]
    Protocol(String),

    /// Frame without a `command` field.
    #[error("Missing command field")]
    MissingCommand,

    /// `command` names nothing in the fixed command table.
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// A command handler failed (bad parameters, panic, ...).
    #[error("Command processing failed: {0}")]
    Handler(String),

    /// Peer reset or closed the connection early.
    #[error("connection error: {0}")]
    Connection(String),

    /// Transfer header exceeded the configured bound.
    #[error("header exceeds {limit} bytes")]
    HeaderTooLarge {
        /// Configured bound in bytes.
        limit: usize,
    },

    /// No bytes from the peer within the idle window.
    #[error("idle for more than {0:?}")]
    IdleTimeout(std::time::Duration),

    /// Filesystem failure while persisting session data.
    #[error("file io error: {0}")]
    FileIo(#[from] std::io::Error),

    /// Missing session directory, devices, or flash events.
    #[error("invalid validation input: {0}")]
    ValidationInput(String),
}

impl SyncError {
    /// Whether the connection that produced this error can keep serving.
    ///
    /// Protocol- and command-level errors are answered with an `error`
    /// message; transport-level ones end the connection.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SyncError::Protocol(_)
                | SyncError::MissingCommand
                | SyncError::UnknownCommand(_)
                | SyncError::Handler(_)
        )
    }

    /// Short machine-readable code carried in `error` messages.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::Protocol(_) => "E_PROTOCOL",
            SyncError::MissingCommand => "E_MISSING_COMMAND",
            SyncError::UnknownCommand(_) => "E_UNKNOWN_COMMAND",
            SyncError::Handler(_) => "E_HANDLER",
            SyncError::Connection(_) => "E_CONNECTION",
            SyncError::HeaderTooLarge { .. } => "E_HEADER_TOO_LARGE",
            SyncError::IdleTimeout(_) => "E_IDLE_TIMEOUT",
            SyncError::FileIo(_) => "E_FILE_IO",
            SyncError::ValidationInput(_) => "E_VALIDATION_INPUT",
        }
    }
}
