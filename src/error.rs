//! Crate-wide error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error, one variant per subsystem.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    WebSocket(#[from] WebSocketError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Database errors. `StaleRow` and `ReferenceError` are retriable: the
/// caller lost an optimistic-concurrency race and should re-run its
/// enclosing transaction.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("row mutated concurrently, retry the transaction")]
    StaleRow,

    #[error("stale dependency reference, retry the transaction")]
    ReferenceError,

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

impl DbError {
    /// Whether re-running the enclosing transaction can succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            DbError::StaleRow | DbError::ReferenceError => true,
            // SQLite reports lock contention as `SQLITE_BUSY`.
            DbError::Sqlx(sqlx::Error::Database(db)) => {
                db.code().as_deref() == Some("5") || db.code().as_deref() == Some("6")
            }
            DbError::Sqlx(_) => false,
        }
    }
}

/// Transport errors, classified the way the journal worker consumes them:
/// connection errors abort the drain without a retry bump, HTTP errors
/// count against the entry's retry ceiling.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("cannot connect to the controller: {0}")]
    Connection(String),

    #[error("controller returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("unexpected response from the controller: {0}")]
    InvalidResponse(String),
}

impl TransportError {
    pub fn is_connection_error(&self) -> bool {
        matches!(self, TransportError::Connection(_))
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            TransportError::Connection(err.to_string())
        } else if let Some(status) = err.status() {
            TransportError::Http {
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else {
            TransportError::Connection(err.to_string())
        }
    }
}

/// WebSocket receiver errors. A rejected subscription (HTTP 400) means the
/// configured path is wrong and retrying cannot help.
#[derive(Debug, Error)]
pub enum WebSocketError {
    #[error("change-event subscription rejected, check the configured path: {0}")]
    SubscriptionRejected(String),

    #[error("stream not available yet: {0}")]
    StreamUnavailable(String),

    #[error("websocket transport error: {0}")]
    Socket(String),
}
