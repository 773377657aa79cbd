use std::fmt::Display;

/// Value log errors.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// A record's framing is invalid: short read, impossible length, or a
    /// zeroed tail. Iteration stops at the previous record boundary and the
    /// caller truncates the file there. Never fatal.
    Truncate,
    /// Returned by an iteration callback to end the scan early. Never escapes
    /// the iteration itself.
    Stop,
    /// The sampled file did not contain enough discardable data to justify a
    /// rewrite.
    NoRewrite,
    /// Another garbage collection run already holds the slot.
    Rejected,
    /// The batch exceeds what the LSM tree can apply in a single transaction.
    TxnTooBig,
    /// A stored checksum does not match the record contents.
    ChecksumMismatch,
    /// The log tail is corrupt but the store is read-only and cannot truncate.
    TruncateNeeded { end_offset: u32, size: u32 },
    /// A write was attempted on a read-only value log.
    ReadOnly,
    /// Invalid data, typically decoding errors, corruption, or unexpected
    /// internal values.
    InvalidData(String),
    /// An IO error.
    IO(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Truncate => write!(f, "log truncation required"),
            Error::Stop => write!(f, "stop iteration"),
            Error::NoRewrite => write!(f, "file not eligible for rewrite"),
            Error::Rejected => write!(f, "garbage collection already running"),
            Error::TxnTooBig => write!(f, "batch too big for a single transaction"),
            Error::ChecksumMismatch => write!(f, "checksum mismatch"),
            Error::TruncateNeeded { end_offset, size } => {
                write!(f, "truncation needed at offset {end_offset}, file size {size}")
            }
            Error::ReadOnly => write!(f, "write attempted on read-only value log"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
        }
    }
}

/// Constructs an Error::InvalidData for the given format string.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)).into() };
}

/// An emberlog Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}
