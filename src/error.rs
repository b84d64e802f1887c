use std::fmt;
use std::io;

#[derive(Debug)]
pub enum StoreError {
    /// The region file is closing or closed.
    Closed,
    DoubleClose {
        index: usize,
    },
    IndexOutOfRange {
        index: usize,
        entries: usize,
    },
    EntryTooLarge {
        index: usize,
        len: usize,
    },
    /// No block run of the requested size can be addressed.
    RegionFull,
    InvalidConfig(String),
    Io(io::Error),
}

impl StoreError {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "region file is closed"),
            Self::DoubleClose { index } => {
                write!(f, "attempt made to close the writer for entry {index} twice")
            }
            Self::IndexOutOfRange { index, entries } => {
                write!(f, "entry index {index} out of range for {entries} entries")
            }
            Self::EntryTooLarge { index, len } => {
                write!(f, "entry {index} of {len} bytes exceeds the region file entry limit")
            }
            Self::RegionFull => write!(f, "region file block space exhausted"),
            Self::InvalidConfig(message) => write!(f, "invalid region file config: {message}"),
            Self::Io(error) => write!(f, "region file io error: {error}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(error) => Some(error),
            _ => None,
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<StoreError> for io::Error {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Io(error) => error,
            other => io::Error::other(other),
        }
    }
}
