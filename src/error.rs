/// A storage error. All fallible operations return these; I/O and corruption
/// errors are surfaced to the caller unchanged, with no retries and no
/// automatic repair of bad segments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// A record whose stored CRC does not match its value bytes, or whose
    /// body disagrees with its header.
    Corrupt(String),
    /// A keydir entry and the record it points at disagree.
    Invariant(String),
    /// An underlying filesystem failure.
    IO(String),
    /// A key or value too large to fit in a record header.
    Oversize(String),
    /// A segment that ends partway through a record.
    Truncated(String),
}

/// A storage result, using the crate-local error type.
pub type Result<T> = std::result::Result<T, Error>;

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Corrupt(msg) => write!(f, "corrupt record: {msg}"),
            Error::Invariant(msg) => write!(f, "invariant violation: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::Oversize(msg) => write!(f, "oversize record: {msg}"),
            Error::Truncated(msg) => write!(f, "truncated segment: {msg}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Corrupt(err.to_string())
    }
}
