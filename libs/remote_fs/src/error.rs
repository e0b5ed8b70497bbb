use std::error::Error as StdError;

/// Terminal outcome of a mediated filesystem call.
///
/// The `Ok`/`Err` discriminant of a `Result<T, FsError>` is the authoritative
/// status of the call; callers must not look at a partially-produced value
/// for a failed call, there is none.
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    /// The object does not exist on the remote side. Not retried.
    #[error("object not found")]
    NotFound,

    /// The per-attempt budget of the task executor ran out and the work was
    /// forcibly aborted.
    #[error("remote filesystem call timed out")]
    Timeout,

    /// The caller asked to abort the wait.
    #[error("remote filesystem call was cancelled")]
    Cancelled,

    /// The remote filesystem could not be dialed.
    #[error("remote filesystem is not reachable")]
    NotReachable,

    /// The operation is meaningless for this filesystem kind (e.g. object
    /// stores have no replication factor).
    #[error("operation is not supported by this filesystem")]
    Unsupported,

    /// Malformed descriptor, path or flags.
    #[error("bad input: {0}")]
    BadInput(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FsError {
    /// Errors the bridge's retry loop must not retry: the remote answered,
    /// the answer just was not the one the caller hoped for.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            FsError::NotFound | FsError::Cancelled | FsError::Unsupported | FsError::BadInput(_)
        )
    }

    /// Peels `anyhow` wrapping to find out whether the root cause was our own
    /// timeout or cancellation, so retry classification survives `.context()`.
    pub fn is_timeout_or_cancel(err: &(dyn StdError + 'static)) -> bool {
        let mut cause: Option<&(dyn StdError + 'static)> = Some(err);
        while let Some(err) = cause {
            if let Some(fs) = err.downcast_ref::<FsError>() {
                return matches!(fs, FsError::Timeout | FsError::Cancelled);
            }
            cause = err.source();
        }
        false
    }
}

impl From<std::io::Error> for FsError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => FsError::NotFound,
            std::io::ErrorKind::TimedOut => FsError::Timeout,
            _ => FsError::Other(anyhow::Error::new(e)),
        }
    }
}
