use std::path::PathBuf;

/// Error taxonomy for the engine. Numeric codes are preserved via
/// [`Error::legacy_code`] for callers that still want the historical
/// CuttDB error space; nothing internal switches on them.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("key not found")]
    NotFound,

    #[error("key already exists")]
    Exist,

    #[error("database directory does not exist: {0}")]
    PathOpenFailed(PathBuf),

    #[error("failed to open file {path}: {source}")]
    FileOpenFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("database is already opened by process {pid}")]
    OpenedByAnotherProcess { pid: u32 },

    #[error("data segment {fid} is corrupt at offset {offset}: {reason}")]
    DataFileContentError {
        fid: u32,
        offset: u64,
        reason: &'static str,
    },

    #[error("index segment {fid} is corrupt at offset {offset}: {reason}")]
    IndexFileContentError {
        fid: u32,
        offset: u64,
        reason: &'static str,
    },

    #[error("write to segment {fid} failed: {source}")]
    WriteError {
        fid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("read from segment {fid} failed: {source}")]
    ReadError {
        fid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("internal file lost: {0}")]
    InternalFileLost(PathBuf),

    #[error("internal error: {0}")]
    InternalError(&'static str),

    #[error("header file is malformed or has an unexpected magic")]
    HeaderError,

    #[error("in-memory database has no durable store, cache overflowed")]
    MemDbNoCache,

    #[error("no free file id available after exhausting the 24-bit fid space")]
    NoFreeFid,
}

impl Error {
    /// Returns the original CuttDB numeric error code for this variant, for
    /// embedders that interoperate with the legacy error-code space.
    pub fn legacy_code(&self) -> i32 {
        match self {
            Error::NotFound => 1,
            Error::Exist => 2,
            Error::PathOpenFailed(_) => 3,
            Error::FileOpenFailed { .. } => 4,
            Error::OpenedByAnotherProcess { .. } => 5,
            Error::DataFileContentError { .. } => 6,
            Error::IndexFileContentError { .. } => 7,
            Error::WriteError { .. } => 8,
            Error::ReadError { .. } => 9,
            Error::NoFreeFid => 10,
            Error::InternalError(_) => 11,
            Error::HeaderError => 12,
            Error::MemDbNoCache => 13,
            Error::InternalFileLost(_) => 11,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
