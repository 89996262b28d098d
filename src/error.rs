//! Error taxonomy shared by the decoder, the capture controller and the HTTP layer.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Problems with the bytes of a capture file.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("unrecognized header")]
    UnrecognizedHeader,

    #[error("truncated record at index {at_index}")]
    TruncatedRecord { at_index: usize },

    #[error("corrupt record at index {at_index}: {reason}")]
    CorruptRecord { at_index: usize, reason: String },

    #[error("read failed: {0}")]
    Io(String),
}

impl From<std::io::Error> for FormatError {
    fn from(err: std::io::Error) -> Self {
        FormatError::Io(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("invalid filter expression '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("permission denied opening interface {interface}")]
    PermissionDenied { interface: String },

    #[error("no such interface: {interface}")]
    NoSuchInterface { interface: String },

    #[error("a capture is already running on {interface}")]
    CaptureInProgress { interface: String },

    #[error("no capture is running on {interface}")]
    NotRunning { interface: String },

    #[error("timed out opening interface {interface}")]
    OpenTimeout { interface: String },

    #[error("invalid capture limit: {0}")]
    InvalidLimit(String),

    #[error("capture backend error: {0}")]
    Backend(String),

    #[error("failed writing capture file: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("at least {required} capture files are required, got {supplied}")]
    TooFewCaptures { required: usize, supplied: usize },

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("unsupported file type: {0}")]
    UnsupportedExtension(String),
}

/// Errors from the working-directory file store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("file not found: {0}")]
    NotFound(String),

    #[error("invalid file name: {0}")]
    InvalidName(String),

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level error surfaced verbatim at the HTTP boundary.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("worker failed: {0}")]
    Worker(String),
}
