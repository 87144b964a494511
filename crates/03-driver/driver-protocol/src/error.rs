use thiserror::Error;

pub type ProtocolResult<T> = Result<T, ProtocolError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("frame truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("unknown message type {0:#x}")]
    UnknownMessageType(i32),

    #[error("string field is not valid utf-8")]
    InvalidUtf8,

    #[error("invalid destination: {0}")]
    InvalidDestination(&'static str),

    #[error("unknown error kind {0}")]
    UnknownErrorKind(i32),

    #[error("receiver lists {count} streams, at most {max} allowed")]
    TooManyStreams { count: usize, max: usize },

    #[error("receiver must list at least one stream")]
    NoStreams,

    #[error("stream {0} listed more than once")]
    DuplicateStream(i32),

    #[error("string field of {0} bytes does not fit a u16 length")]
    FieldTooLong(usize),

    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),
}
