use std::fmt::Display;

/// emberdb errors.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// Key not found. Returned from reads, never fatal.
    NotFound,
    /// An empty key was passed to a read or write operation.
    EmptyKey,
    /// A CRC32C check failed. Non-fatal for SST block reads (the record is
    /// skipped at the block boundary), fatal during manifest replay.
    ChecksumMismatch { actual: u32, expected: u32 },
    /// The manifest file does not start with the expected magic bytes.
    BadMagic,
    /// The manifest file carries a version this build does not understand.
    UnsupportedVersion(u32),
    /// Compaction could not assemble a plan this tick. Silently ignored;
    /// the worker retries on its next tick.
    FillTables,
    /// Structural corruption: the store refuses to open.
    Corruption(String),
    /// A filesystem error.
    Io(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::NotFound => write!(f, "key not found"),
            Error::EmptyKey => write!(f, "key cannot be empty"),
            Error::ChecksumMismatch { actual, expected } => {
                write!(f, "checksum mismatch: actual {actual:#010x}, expected {expected:#010x}")
            }
            Error::BadMagic => write!(f, "bad magic"),
            Error::UnsupportedVersion(v) => write!(f, "unsupported manifest version: {v}"),
            Error::FillTables => write!(f, "unable to fill tables"),
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
        }
    }
}

/// Constructs an Error::Corruption from the given format string.
#[macro_export]
macro_rules! corruption {
    ($($args:tt)*) => { $crate::error::Error::Corruption(format!($($args)*)) };
}

/// An emberdb Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Io(err.to_string())
    }
}
