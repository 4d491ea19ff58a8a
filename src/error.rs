//! Errors surfaced by the public cache API.  Most filesystem trouble
//! is absorbed closer to the bucket files and turns into cache misses;
//! what remains here is what callers must actually handle.
use std::io;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The cache root could not be created, is not a directory, or
    /// cannot be listed.  Only `open` returns this.
    #[error("cache directory {} is unavailable: {source}", path.display())]
    DirectoryUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// We could not allocate enough memory to materialise a bucket.
    #[error("out of memory while reading bucket {}", path.display())]
    MemoryPressure { path: PathBuf },

    #[error("failed to encode record: {0}")]
    Encode(#[from] bincode::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn directory_unavailable(path: impl Into<PathBuf>, source: io::Error) -> Error {
        Error::DirectoryUnavailable {
            path: path.into(),
            source,
        }
    }

    /// Returns whether this error is a memory pressure signal, which
    /// full scans try to recover from once.
    pub fn is_memory_pressure(&self) -> bool {
        matches!(self, Error::MemoryPressure { .. })
    }
}

#[test]
fn test_display() {
    let err = Error::directory_unavailable(
        "/nonexistent/cache",
        io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
    );
    assert_eq!(
        err.to_string(),
        "cache directory /nonexistent/cache is unavailable: denied"
    );
    assert!(!err.is_memory_pressure());

    let err = Error::MemoryPressure {
        path: PathBuf::from("/tmp/7.block.ser.gz"),
    };
    assert!(err.is_memory_pressure());
    assert_eq!(
        err.to_string(),
        "out of memory while reading bucket /tmp/7.block.ser.gz"
    );
}
