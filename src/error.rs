use std::io;

/// Errors surfaced by every public operation on [`crate::Deque`] and its
/// segments.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("missing pbd segments between {from} and {to}")]
    MissingSegments { from: i64, to: i64 },

    #[error("record of {size} bytes exceeds the maximum of {max} bytes for a single segment")]
    RecordTooLarge { size: usize, max: usize },

    #[error("operation attempted on a closed deque")]
    Closed,

    #[error("corrupt segment: {0}")]
    Corrupt(String),

    #[error("truncator error: {0}")]
    Truncator(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Error returned from [`crate::Deque::parse_and_truncate`], which layers a
/// caller-supplied truncator's own error type `E` over the deque's own
/// `Error`.
#[derive(thiserror::Error, Debug)]
pub enum TruncateError<E> {
    #[error(transparent)]
    Deque(#[from] Error),
    #[error("truncator error: {0}")]
    Truncator(E),
}
