//! The unit of cache residency: one remote object materialized (or being
//! materialized) at its derived local path.
//!
//! A `CachedFile` is a cheap clone over shared state. The state machine is
//! NEW → DOWNLOADING → READY, with EVICTING deferring physical removal
//! while readers hold pins, FAILED parking a broken origin for a cooldown,
//! and DELETED terminal. DOWNLOADING leaves the state for exactly one of
//! READY, FAILED or DELETED.
//!
//! Producer election is the single-flight core: whoever moves the state out
//! of NEW owns the transfer; everyone else waits on the file's watch
//! channel with a deadline and a cancellation token. The state mutex plus
//! the channel give waiters the release/acquire edge they need: a reader
//! that observes READY also observes every byte the producer committed
//! before the transition.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use remote_fs::bridge::FsBridge;
use remote_fs::{FsError, GenericRemoteFs};

use crate::cache::FileCache;
use crate::metrics::CACHE_METRICS;
use crate::namespace::RemoteOrigin;
use crate::TEMP_FILE_SUFFIX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileNature {
    /// Materialized from a remote object.
    Physical,
    /// Write-producer of a CREATE TABLE AS SELECT; the local file is linked
    /// to a remote sink uploaded on close.
    CreateFromSelect,
}

#[derive(Debug, Clone)]
pub enum FileState {
    New,
    Downloading,
    Ready { size: u64 },
    /// Removal is reserved but deferred; existing readers keep being served.
    Evicting { size: u64 },
    Failed { error: String, retry_at: Instant },
    Deleted,
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download was cancelled")]
    Cancelled,
    #[error("wait for a concurrent download timed out")]
    WaitTimeout,
    #[error("download failed: {0}")]
    Failed(String),
    #[error("file was deleted while waiting")]
    Deleted,
    #[error("cache admission would exceed the hard limit")]
    CapacityExceeded,
}

/// Everything a producer or waiter needs, threaded through from the
/// registry so the file itself stays free of service references.
pub(crate) struct DownloadContext<'a> {
    pub(crate) cache: &'a FileCache,
    pub(crate) bridge: &'a FsBridge,
    pub(crate) fs: &'a GenericRemoteFs,
    pub(crate) cancel: &'a CancellationToken,
    pub(crate) wait_deadline: Option<std::time::Duration>,
    /// Opt out of over-commit: fail the admission instead of letting the
    /// cache transiently exceed its hard limit.
    pub(crate) strict_capacity: bool,
}

struct CachedFileInner {
    local_path: Utf8PathBuf,
    nature: FileNature,
    /// Filled on the first lookup that knows the origin; files re-admitted
    /// by the startup walk start without one.
    origin: Mutex<Option<RemoteOrigin>>,
    state: Mutex<FileState>,
    state_tx: watch::Sender<()>,
    refcount: AtomicI64,
    dirty: AtomicBool,
    last_access_tick: AtomicU64,
    /// Inode of the materialized bytes (0 = unknown). Deferred unlinks
    /// compare it so a newer incarnation renamed into the same path is
    /// never deleted by a stale reservation.
    ino: AtomicU64,
}

#[derive(Clone)]
pub struct CachedFile(Arc<CachedFileInner>);

impl std::fmt::Debug for CachedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedFile")
            .field("local_path", &self.0.local_path)
            .field("state", &self.state())
            .field("refcount", &self.ref_count())
            .finish()
    }
}

impl CachedFile {
    fn with_state(local_path: Utf8PathBuf, nature: FileNature, state: FileState) -> Self {
        let (state_tx, _) = watch::channel(());
        CachedFile(Arc::new(CachedFileInner {
            local_path,
            nature,
            origin: Mutex::new(None),
            state: Mutex::new(state),
            state_tx,
            refcount: AtomicI64::new(0),
            dirty: AtomicBool::new(false),
            last_access_tick: AtomicU64::new(0),
            ino: AtomicU64::new(0),
        }))
    }

    pub(crate) fn new(local_path: Utf8PathBuf, nature: FileNature) -> Self {
        Self::with_state(local_path, nature, FileState::New)
    }

    /// A file already present on disk (startup enumeration, finished
    /// CREATE_FROM_SELECT output).
    pub(crate) fn new_resident(local_path: Utf8PathBuf, nature: FileNature, size: u64) -> Self {
        Self::with_state(local_path, nature, FileState::Ready { size })
    }

    pub fn local_path(&self) -> &Utf8Path {
        &self.0.local_path
    }

    pub fn nature(&self) -> FileNature {
        self.0.nature
    }

    pub fn state(&self) -> FileState {
        self.0.state.lock().unwrap().clone()
    }

    /// Size is only meaningful from READY onwards.
    pub fn size(&self) -> Option<u64> {
        match self.state() {
            FileState::Ready { size } | FileState::Evicting { size } => Some(size),
            _ => None,
        }
    }

    pub fn ref_count(&self) -> i64 {
        self.0.refcount.load(Ordering::Acquire)
    }

    pub fn is_pinned(&self) -> bool {
        self.ref_count() > 0
    }

    /// The remote side is believed changed; the next unpinned open
    /// re-downloads.
    pub fn mark_dirty(&self) {
        self.0.dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.0.dirty.load(Ordering::Acquire)
    }

    pub(crate) fn set_origin(&self, origin: &RemoteOrigin) {
        let mut slot = self.0.origin.lock().unwrap();
        if slot.is_none() {
            *slot = Some(origin.clone());
        }
    }

    pub(crate) fn origin(&self) -> Option<RemoteOrigin> {
        self.0.origin.lock().unwrap().clone()
    }

    pub(crate) fn touch(&self, tick: u64) {
        self.0.last_access_tick.store(tick, Ordering::Release);
    }

    pub(crate) fn set_ino(&self, ino: u64) {
        self.0.ino.store(ino, Ordering::Release);
    }

    pub(crate) fn ino(&self) -> Option<u64> {
        match self.0.ino.load(Ordering::Acquire) {
            0 => None,
            ino => Some(ino),
        }
    }

    pub fn last_access_tick(&self) -> u64 {
        self.0.last_access_tick.load(Ordering::Acquire)
    }

    pub(crate) fn pin(&self) -> FilePin {
        FilePin::new(self.clone())
    }

    /// Identity comparison: same incarnation, not merely same path.
    pub(crate) fn same(&self, other: &CachedFile) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn set_state(&self, new: FileState) {
        *self.0.state.lock().unwrap() = new;
        self.0.state_tx.send_replace(());
    }

    /// Reserves the file for eviction. Only an unpinned READY file is
    /// eligible; pinned files are never evicted underneath their readers.
    pub(crate) fn try_begin_eviction(&self) -> Option<u64> {
        let mut state = self.0.state.lock().unwrap();
        match &*state {
            FileState::Ready { size } if self.0.refcount.load(Ordering::Acquire) == 0 => {
                let size = *size;
                *state = FileState::Evicting { size };
                drop(state);
                self.0.state_tx.send_replace(());
                Some(size)
            }
            _ => None,
        }
    }

    /// Resolves the file to a pinned READY incarnation, downloading if this
    /// caller wins the producer election, waiting otherwise.
    pub(crate) async fn ensure_ready(
        &self,
        ctx: &DownloadContext<'_>,
    ) -> Result<FilePin, DownloadError> {
        let deadline = ctx
            .wait_deadline
            .map(|d| tokio::time::Instant::now() + d);

        loop {
            // subscribe before inspecting the state so a transition between
            // the check and the wait is never missed
            let mut rx = self.0.state_tx.subscribe();

            enum Action {
                Produce { redownload_of: Option<u64> },
                Wait,
                // pinned under the state lock, so eviction's unpinned check
                // cannot interleave between observing READY and the pin
                Done(FilePin),
            }

            let action = {
                let mut state = self.0.state.lock().unwrap();
                match &*state {
                    FileState::New => {
                        *state = FileState::Downloading;
                        Action::Produce { redownload_of: None }
                    }
                    FileState::Ready { size } => {
                        if self.is_dirty() && self.0.refcount.load(Ordering::Acquire) == 0 {
                            let old = *size;
                            self.0.dirty.store(false, Ordering::Release);
                            *state = FileState::Downloading;
                            Action::Produce {
                                redownload_of: Some(old),
                            }
                        } else {
                            Action::Done(self.pin())
                        }
                    }
                    FileState::Evicting { .. } => {
                        // the reservation already pulled this incarnation out
                        // of the index; existing pins keep reading, a new
                        // request re-materializes under a fresh entry
                        return Err(DownloadError::Deleted);
                    }
                    FileState::Downloading => Action::Wait,
                    FileState::Failed { error, retry_at } => {
                        if Instant::now() >= *retry_at {
                            *state = FileState::Downloading;
                            Action::Produce { redownload_of: None }
                        } else {
                            return Err(DownloadError::Failed(error.clone()));
                        }
                    }
                    FileState::Deleted => return Err(DownloadError::Deleted),
                }
            };

            match action {
                Action::Done(pin) => return Ok(pin),
                Action::Produce { redownload_of } => {
                    self.0.state_tx.send_replace(());
                    return self.produce(ctx, redownload_of).await;
                }
                Action::Wait => {
                    let changed = rx.changed();
                    match deadline {
                        Some(deadline) => tokio::select! {
                            res = tokio::time::timeout_at(deadline, changed) => {
                                if res.is_err() {
                                    return Err(DownloadError::WaitTimeout);
                                }
                            }
                            _ = ctx.cancel.cancelled() => return Err(DownloadError::Cancelled),
                        },
                        None => tokio::select! {
                            _ = changed => {}
                            _ = ctx.cancel.cancelled() => return Err(DownloadError::Cancelled),
                        },
                    }
                }
            }
        }
    }

    /// The elected producer's path: transfer to a temporary sibling, rename,
    /// publish READY, reconcile accounting, wake everyone.
    async fn produce(
        &self,
        ctx: &DownloadContext<'_>,
        redownload_of: Option<u64>,
    ) -> Result<FilePin, DownloadError> {
        CACHE_METRICS.downloads_started.inc();

        // If this future is dropped mid-transfer (the query future was
        // dropped, not cancelled), the election must reopen or every waiter
        // would starve on a DOWNLOADING state nobody owns.
        let abandoned = scopeguard::guard(self.clone(), |file| {
            warn!(path = %file.0.local_path, "producer abandoned mid-download, reopening election");
            file.set_state(match redownload_of {
                Some(old) => FileState::Ready { size: old },
                None => FileState::New,
            });
        });

        let transfer = self.transfer(ctx);
        let result = tokio::select! {
            res = transfer => res,
            _ = ctx.cancel.cancelled() => Err(FsError::Cancelled),
        };

        drop(scopeguard::ScopeGuard::into_inner(abandoned));

        match result {
            Ok(size) => {
                // pin before publishing READY so a concurrent admission's
                // make-room pass can never select the fresh file
                let pin = self.pin();
                self.set_state(FileState::Ready { size });
                CACHE_METRICS.downloads_completed.inc();
                ctx.cache.reconcile_admission(self, size, redownload_of);
                if ctx.strict_capacity && ctx.cache.occupancy() > ctx.cache.hard_limit() {
                    drop(pin);
                    ctx.cache.remove(&self.0.local_path, true);
                    return Err(DownloadError::CapacityExceeded);
                }
                info!(path = %self.0.local_path, size, "download complete");
                Ok(pin)
            }
            Err(FsError::Cancelled) => {
                CACHE_METRICS.downloads_cancelled.inc();
                self.remove_temp().await;
                match redownload_of {
                    // the previous incarnation is still intact on disk
                    Some(old) => {
                        self.0.dirty.store(true, Ordering::Release);
                        self.set_state(FileState::Ready { size: old });
                    }
                    None => {
                        self.set_state(FileState::Deleted);
                        ctx.cache.forget(self);
                    }
                }
                Err(DownloadError::Cancelled)
            }
            Err(e) => {
                CACHE_METRICS.downloads_failed.inc();
                self.remove_temp().await;
                let error = format!("{e:#}");
                warn!(path = %self.0.local_path, "download failed: {error}");
                match redownload_of {
                    Some(old) => {
                        // serve the stale copy rather than nothing; the
                        // dirty flag keeps the retry pending
                        self.0.dirty.store(true, Ordering::Release);
                        let pin = self.pin();
                        self.set_state(FileState::Ready { size: old });
                        Ok(pin)
                    }
                    None => {
                        self.set_state(FileState::Failed {
                            error: error.clone(),
                            retry_at: Instant::now() + ctx.cache.failure_cooldown(),
                        });
                        Err(DownloadError::Failed(error))
                    }
                }
            }
        }
    }

    /// Streams remote bytes into `<local>___temp` and renames on success.
    /// Each chunk read carries the descriptor's per-attempt budget, so a
    /// remote that goes dark mid-transfer surfaces as a timeout instead of a
    /// wedged producer.
    async fn transfer(&self, ctx: &DownloadContext<'_>) -> Result<u64, FsError> {
        let origin = self.origin().ok_or_else(|| {
            FsError::BadInput(format!("{} has no remote origin recorded", self.0.local_path))
        })?;
        let timeouts = ctx.bridge.config().timeouts_for(&origin.descriptor);

        if let Some(parent) = self.0.local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp = self.temp_path();

        let mut reader = tokio::time::timeout(timeouts.timeout_base, ctx.fs.open_read(&origin.path))
            .await
            .map_err(|_| FsError::Timeout)??;

        let mut file = tokio::fs::File::create(&temp).await?;
        let mut buf = vec![0u8; ctx.cache.download_chunk()];
        let mut written = 0u64;
        loop {
            let n = tokio::time::timeout(timeouts.timeout_base, reader.read(&mut buf))
                .await
                .map_err(|_| FsError::Timeout)??;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).await?;
            written += n as u64;
        }
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&temp, &self.0.local_path).await?;
        {
            use std::os::unix::fs::MetadataExt;
            let meta = tokio::fs::metadata(&self.0.local_path).await?;
            self.set_ino(meta.ino());
        }
        Ok(written)
    }

    fn temp_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("{}{}", self.0.local_path, TEMP_FILE_SUFFIX))
    }

    async fn remove_temp(&self) {
        if let Err(e) = tokio::fs::remove_file(self.temp_path()).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.0.local_path, "failed to remove temporary download: {e}");
            }
        }
    }
}

/// A live reference to a READY file. While any pin exists the file is
/// ineligible for physical removal, even after an eviction reserved it.
pub struct FilePin {
    file: CachedFile,
}

impl FilePin {
    fn new(file: CachedFile) -> Self {
        file.0.refcount.fetch_add(1, Ordering::AcqRel);
        FilePin { file }
    }

    pub fn file(&self) -> &CachedFile {
        &self.file
    }

    pub fn local_path(&self) -> &Utf8Path {
        self.file.local_path()
    }
}

impl Clone for FilePin {
    fn clone(&self) -> Self {
        FilePin::new(self.file.clone())
    }
}

impl Drop for FilePin {
    fn drop(&mut self) {
        // deferred physical deletion of an EVICTING file is the sweeper's
        // job; the pin only gives up the reservation
        self.file.0.refcount.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pins_count_and_release() {
        let file = CachedFile::new_resident(
            Utf8PathBuf::from("/cache/hdfs/nn1/f"),
            FileNature::Physical,
            10,
        );
        assert!(!file.is_pinned());
        let a = file.pin();
        let b = a.clone();
        assert_eq!(file.ref_count(), 2);
        drop(a);
        assert_eq!(file.ref_count(), 1);
        drop(b);
        assert!(!file.is_pinned());
    }

    #[test]
    fn pinned_file_cannot_begin_eviction() {
        let file = CachedFile::new_resident(
            Utf8PathBuf::from("/cache/hdfs/nn1/f"),
            FileNature::Physical,
            10,
        );
        let pin = file.pin();
        assert!(file.try_begin_eviction().is_none());
        drop(pin);
        assert_eq!(file.try_begin_eviction(), Some(10));
        assert!(matches!(file.state(), FileState::Evicting { size: 10 }));
    }

    #[test]
    fn only_ready_files_are_evictable() {
        let file = CachedFile::new(
            Utf8PathBuf::from("/cache/hdfs/nn1/f"),
            FileNature::Physical,
        );
        // NEW and DOWNLOADING fail the reservation
        assert!(file.try_begin_eviction().is_none());
        file.set_state(FileState::Downloading);
        assert!(file.try_begin_eviction().is_none());
        // so does a reservation that already happened
        file.set_state(FileState::Evicting { size: 10 });
        assert!(file.try_begin_eviction().is_none());
    }
}
