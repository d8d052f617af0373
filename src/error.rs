use thiserror::Error;

/// Library error type for hass-frame operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The hub connection failed, closed or violated the expected protocol.
    #[error("hub transport failure: {0}")]
    Transport(String),

    /// The hub refused the configured access token.
    #[error("hub rejected authentication: {0}")]
    AuthRejected(String),

    /// A hub command returned an unsuccessful result.
    #[error("hub command `{command}` failed: {message}")]
    Command { command: String, message: String },

    /// The dashboard capture did not produce an image.
    #[error("capture failed: {0}")]
    Capture(String),

    /// A display device operation failed.
    #[error("display device {operation} failed: {message}")]
    Device {
        operation: &'static str,
        message: String,
    },

    /// Underlying ledger database error.
    #[error(transparent)]
    Ledger(#[from] rusqlite::Error),

    /// Underlying IO error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Malformed JSON from the hub.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Captured bytes could not be decoded as an image.
    #[error(transparent)]
    Image(#[from] image::ImageError),
}

impl Error {
    pub fn device(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Device {
            operation,
            message: message.into(),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
