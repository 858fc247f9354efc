use thiserror::Error;

#[derive(Error, Debug)]
pub enum KvError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Strict-mode absence of a key, field or member.
    #[error("not found")]
    NotFound,

    #[error("invalid transaction state: {0}")]
    InvalidState(String),

    #[error("transaction session is closed")]
    SessionClosed,

    #[error("transaction session used from a different call context")]
    StaleContext,

    #[error("transaction aborted: a watched key was modified")]
    TransactionAborted,

    #[error("remote error: {0}")]
    Remote(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected reply: expected {expected}, got {got}")]
    UnexpectedReply { expected: &'static str, got: String },

    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("value is not an integer or out of range")]
    NotInteger,

    #[error("value is not a valid float")]
    NotFloat,

    #[error("no such key")]
    NoSuchKey,

    #[error("invalid cursor")]
    InvalidCursor,

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, KvError>;
