//! Local materialization cache for remote scan targets.
//!
//! A process-wide, on-disk, size-bounded cache that pulls blocks of remote
//! objects into a local working area so scan operators read at local-disk
//! speed. The entry point is [`registry::CacheRegistry`]; everything else is
//! plumbing underneath it:
//!
//! * [`namespace`] — deterministic remote-origin to local-path mapping
//! * [`cached_file`] — the unit of residency and its state machine
//! * [`cache`] — weighted LRU admission and eviction over cached files
//! * [`sweep`] — the background eviction and cleanup loop
//! * [`handle`] — the scanner-facing open/read/seek/close surface

pub mod cache;
pub mod cached_file;
pub mod config;
pub mod handle;
pub mod metrics;
pub mod namespace;
pub mod registry;
pub mod sweep;

use camino::Utf8Path;

/// Suffix the producer writes under before renaming into the final name.
/// A crash never leaves a partial file with a scannable name.
pub const TEMP_FILE_SUFFIX: &str = "___temp";

pub fn is_temporary(path: &Utf8Path) -> bool {
    match path.file_name() {
        Some(name) => name.ends_with(TEMP_FILE_SUFFIX),
        None => false,
    }
}

/// Error kinds the cache surfaces to the embedding engine. Scanners see
/// either bytes or one of these; never a partial read of a failed download.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("filesystem {0} is not reachable")]
    NotReachable(String),

    #[error("remote operation timed out")]
    Timeout,

    #[error("remote i/o failure: {0}")]
    RemoteIO(String),

    #[error("cache admission refused: {0}")]
    CapacityExceeded(String),

    #[error("operation on a closed or released handle")]
    InvalidHandle,

    #[error("wait aborted by caller")]
    Cancelled,

    #[error("object not found")]
    NotFound,

    #[error("operation not supported by the target filesystem")]
    Unsupported,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<remote_fs::FsError> for CacheError {
    fn from(e: remote_fs::FsError) -> Self {
        use remote_fs::FsError;
        match e {
            FsError::NotFound => CacheError::NotFound,
            FsError::Timeout => CacheError::Timeout,
            FsError::Cancelled => CacheError::Cancelled,
            FsError::NotReachable => CacheError::NotReachable("remote filesystem".to_owned()),
            FsError::Unsupported => CacheError::Unsupported,
            FsError::BadInput(msg) => CacheError::Config(msg),
            FsError::Other(e) => CacheError::RemoteIO(format!("{e:#}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_suffix_detection() {
        assert!(is_temporary(Utf8Path::new("/cache/hdfs/nn1/a/b.parq___temp")));
        assert!(!is_temporary(Utf8Path::new("/cache/hdfs/nn1/a/b.parq")));
    }
}
