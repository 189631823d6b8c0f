use crate::config::ConfigError;
use crate::coordinator::cancel::CancelReason;
use crate::governor::GovernorState;
use crate::selection::ParseError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while reading a source file.
/// Aggregates errors from the standard library, the format crates and the internal helpers.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("{0}")]
    WithContextError(String),

    /// File extension or container is not something the readers understand.
    #[error("Unsupported source: {0}")]
    Unsupported(String),

    /// Content is structurally invalid, or a reader panicked on it.
    #[error("Corrupt source: {0}")]
    Corrupt(String),

    // Standard library errors
    #[error("{0}")]
    IoError(#[from] std::io::Error),

    #[error("{0}")]
    ParseIntError(#[from] std::num::ParseIntError),

    #[error("{0}")]
    ParseFloatError(#[from] std::num::ParseFloatError),

    #[error("{0}")]
    StringEncodingError(#[from] std::str::Utf8Error),

    // Third-party library errors
    #[error("{0}")]
    ZipError(#[from] zip::result::ZipError),

    #[error("{0}")]
    XmlError(#[from] quick_xml::Error),

    #[error("{0}")]
    XmlEncodingError(#[from] quick_xml::encoding::EncodingError),

    #[error("{0}")]
    XmlAttributeError(#[from] quick_xml::events::attributes::AttrError),

    #[error("{0}")]
    CsvError(#[from] csv::Error),

    #[error("{0}")]
    JsonError(#[from] serde_json::Error),

    // Helper module errors
    #[error("{0}")]
    XmlHelperError(#[from] crate::helpers::xml::XmlError),
}

/// Coarse classification of [`Error`], stable for callers that branch on it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Parse,
    Io,
    ResourceExhausted,
    Cancelled,
    Config,
    Closed,
}

/// Error returned by every public operation of the crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid range expression or unknown sheet. Never retried.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// The file is missing, unreadable or corrupt.
    #[error("Read '{}' failed: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: SourceError,
    },

    /// The governor is in a state where new work is refused.
    #[error("Resources exhausted (governor state: {state:?})")]
    ResourceExhausted { state: GovernorState },

    #[error("Fetch cancelled: {0}")]
    Cancelled(CancelReason),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Coordinator is closed")]
    Closed,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Parse(_) => ErrorKind::Parse,
            Error::Io { .. } => ErrorKind::Io,
            Error::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::Config(_) => ErrorKind::Config,
            Error::Closed => ErrorKind::Closed,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: impl Into<SourceError>) -> Self {
        Error::Io {
            path: path.into(),
            source: source.into(),
        }
    }
}

pub(crate) trait ResultOptionChain {
    fn ok_none_else<F>(self, f: F) -> Self
    where
        F: FnOnce() -> Self;
}

impl<T, E> ResultOptionChain for Result<Option<T>, E> {
    fn ok_none_else<F>(self, f: F) -> Self
    where
        F: FnOnce() -> Self,
    {
        match self {
            Ok(None) => f(),
            _ => self,
        }
    }
}

pub(crate) trait ResultMessage {
    fn with_prefix(self, message: &str) -> Self;
}

impl<T> ResultMessage for Result<T, SourceError> {
    fn with_prefix(self, message: &str) -> Self {
        self.map_err(|e| SourceError::WithContextError(format!("{}: {}", message, e)))
    }
}
