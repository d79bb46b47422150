use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ArchiverError>;

/// The primary error type for all operations in the `zipforge` crate.
#[derive(Debug, Error)]
pub enum ArchiverError {
    /// An I/O error occurred, typically while reading a source file or
    /// writing the destination archive. Includes the path where the error
    /// happened when one is known.
    #[error("I/O error on path '{}': {source}", path.display())]
    Io {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    /// An error reported by the underlying container codec.
    #[error("container codec error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Invalid builder configuration, detected eagerly at configuration time
    /// (for example a manifest file that does not exist).
    #[error("configuration error: {0}")]
    Config(String),

    /// The manifest text was structurally unreadable. Recoverable issues are
    /// collected as warnings on the parsed manifest instead.
    #[error("invalid manifest: {0}")]
    ManifestParse(String),

    /// No entries would be written and creating an empty archive was not
    /// requested.
    #[error("archive would be empty and 'create empty' is not set")]
    EmptyArchive,

    /// A compression worker or the writer thread failed; the whole build is
    /// aborted and the destination is discarded.
    #[error("archive build aborted: {0}")]
    Aborted(String),
}

// Generic IO error conversion that doesn't carry a path
impl From<io::Error> for ArchiverError {
    fn from(err: io::Error) -> Self {
        ArchiverError::Io {
            source: err,
            path: PathBuf::new(),
        }
    }
}

impl ArchiverError {
    pub(crate) fn io(source: io::Error, path: impl Into<PathBuf>) -> Self {
        ArchiverError::Io {
            source,
            path: path.into(),
        }
    }
}
