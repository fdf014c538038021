use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Engine or file-system failure, passed through unchanged.
    Io,
    Parse,
    NotFound,
    InvalidArgument,
    InvalidState,
    /// Invalid segment-size request, or a segment size change after segments exist.
    Configuration,
    /// The database was created with another segment size. Reopen with `stored` bytes.
    SegmentSizeMismatch { requested: u32, stored: u32 },
    /// A stored segment does not decode as its declared kind.
    CorruptSegment,
    /// Operation called out of sequence with the deferred-update session.
    DeferredState,
}

#[derive(Debug)]
pub struct Error {
    pub kind: ErrorKind,
    pub context: String,
}

impl Error {
    pub fn new(kind: ErrorKind, context: String) -> Self {
        Error { kind, context }
    }

    pub fn corrupt(context: String) -> Self {
        Error::new(ErrorKind::CorruptSegment, context)
    }

    pub fn deferred_state(context: &str) -> Self {
        Error::new(ErrorKind::DeferredState, context.to_string())
    }

    /// Stored segment size in bytes when this is a segment size mismatch.
    pub fn stored_segment_size(&self) -> Option<u32> {
        match self.kind {
            ErrorKind::SegmentSizeMismatch { stored, .. } => Some(stored),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.context)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error {
            kind: ErrorKind::Io,
            context: err.to_string(),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error {
            kind: ErrorKind::Parse,
            context: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error {
            kind: ErrorKind::Parse,
            context: format!("JSON error: {}", err),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
