//! Scanner-facing file handles.
//!
//! A handle is whatever the open resolved to: a pinned local copy of a
//! remote object, a direct stream (local filesystem descriptors), or a
//! CREATE_FROM_SELECT writer producing a local file that is uploaded into
//! its registered remote sink on close. Each handle carries the pool lease
//! or pin that backs it; both are released on close and on drop, whichever
//! comes first.

use std::time::Duration;

use camino::Utf8PathBuf;
use tracing::warn;

use remote_fs::pool::PoolLease;
use remote_fs::{CreateOptions, RemoteFileSystem, RemotePath, RemoteReader, RemoteWriter};

use crate::cached_file::{CachedFile, FilePin, FileState};
use crate::registry::CacheRegistry;
use crate::CacheError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub mode: OpenMode,
    /// Copy chunk for the close-time upload; reads use the caller's buffer.
    pub buffer_size: usize,
    pub replication: Option<u32>,
    pub block_size: Option<u64>,
    pub overwrite: bool,
    /// Transform participating in the cache fingerprint.
    pub transform: Option<String>,
    /// Bound on waiting for a concurrent producer; `None` waits for the
    /// download however long it takes (or until cancellation).
    pub wait_timeout: Option<Duration>,
    /// Refuse over-commit: fail the open with a capacity error instead of
    /// letting the admission transiently exceed the hard limit.
    pub strict_capacity: bool,
}

impl OpenOptions {
    pub fn read() -> Self {
        OpenOptions {
            mode: OpenMode::Read,
            buffer_size: 64 * 1024,
            replication: None,
            block_size: None,
            overwrite: false,
            transform: None,
            wait_timeout: None,
            strict_capacity: false,
        }
    }

    pub fn write() -> Self {
        OpenOptions {
            mode: OpenMode::Write,
            overwrite: true,
            ..Self::read()
        }
    }

    pub(crate) fn create_options(&self) -> CreateOptions {
        CreateOptions {
            overwrite: self.overwrite,
            replication: self.replication,
            block_size: self.block_size,
        }
    }
}

enum HandleInner {
    CachedRead {
        _pin: FilePin,
        reader: RemoteReader,
    },
    DirectRead {
        _lease: PoolLease,
        reader: RemoteReader,
    },
    DirectWrite {
        _lease: PoolLease,
        writer: RemoteWriter,
    },
    CreateFromSelect(Box<CfsWrite>),
}

struct CfsWrite {
    registry: CacheRegistry,
    lease: PoolLease,
    writer: RemoteWriter,
    file: CachedFile,
    local_path: Utf8PathBuf,
    previous_size: Option<u64>,
    options: OpenOptions,
}

pub struct FileHandle {
    inner: Option<HandleInner>,
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle").finish()
    }
}

impl FileHandle {
    pub(crate) fn cached_read(pin: FilePin, reader: RemoteReader) -> Self {
        FileHandle {
            inner: Some(HandleInner::CachedRead { _pin: pin, reader }),
        }
    }

    pub(crate) fn direct_read(lease: PoolLease, reader: RemoteReader) -> Self {
        FileHandle {
            inner: Some(HandleInner::DirectRead {
                _lease: lease,
                reader,
            }),
        }
    }

    pub(crate) fn direct_write(lease: PoolLease, writer: RemoteWriter) -> Self {
        FileHandle {
            inner: Some(HandleInner::DirectWrite {
                _lease: lease,
                writer,
            }),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn create_from_select(
        registry: CacheRegistry,
        lease: PoolLease,
        writer: RemoteWriter,
        file: CachedFile,
        local_path: Utf8PathBuf,
        previous_size: Option<u64>,
        options: OpenOptions,
    ) -> Self {
        FileHandle {
            inner: Some(HandleInner::CreateFromSelect(Box::new(CfsWrite {
                registry,
                lease,
                writer,
                file,
                local_path,
                previous_size,
                options,
            }))),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    /// Zero-copy hook: the materialized local file behind a cached-read
    /// handle. The pin this handle holds keeps the file on disk, so the
    /// caller may map it directly instead of going through `read`.
    pub fn local_path(&self) -> Option<&camino::Utf8Path> {
        match &self.inner {
            Some(HandleInner::CachedRead { _pin, .. }) => Some(_pin.local_path()),
            _ => None,
        }
    }

    fn reader(&mut self) -> Result<&mut RemoteReader, CacheError> {
        match &mut self.inner {
            Some(HandleInner::CachedRead { reader, .. })
            | Some(HandleInner::DirectRead { reader, .. }) => Ok(reader),
            _ => Err(CacheError::InvalidHandle),
        }
    }

    fn writer(&mut self) -> Result<&mut RemoteWriter, CacheError> {
        match &mut self.inner {
            Some(HandleInner::DirectWrite { writer, .. }) => Ok(writer),
            Some(HandleInner::CreateFromSelect(cfs)) => Ok(&mut cfs.writer),
            _ => Err(CacheError::InvalidHandle),
        }
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, CacheError> {
        Ok(self.reader()?.read(buf).await?)
    }

    /// Positioned read; the sequential cursor stays put.
    pub async fn pread(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, CacheError> {
        Ok(self.reader()?.read_at(offset, buf).await?)
    }

    pub fn seek(&mut self, pos: u64) -> Result<(), CacheError> {
        Ok(self.reader()?.seek(pos)?)
    }

    pub fn tell(&mut self) -> Result<u64, CacheError> {
        match &mut self.inner {
            Some(HandleInner::CachedRead { reader, .. })
            | Some(HandleInner::DirectRead { reader, .. }) => Ok(reader.tell()),
            Some(HandleInner::DirectWrite { writer, .. }) => Ok(writer.tell()),
            Some(HandleInner::CreateFromSelect(cfs)) => Ok(cfs.writer.tell()),
            None => Err(CacheError::InvalidHandle),
        }
    }

    /// Bytes between the read cursor and EOF.
    pub fn available(&mut self) -> Result<u64, CacheError> {
        match &mut self.inner {
            Some(HandleInner::CachedRead { reader, .. })
            | Some(HandleInner::DirectRead { reader, .. }) => Ok(reader.available()),
            _ => Err(CacheError::InvalidHandle),
        }
    }

    pub fn len(&self) -> Result<u64, CacheError> {
        match &self.inner {
            Some(HandleInner::CachedRead { reader, .. })
            | Some(HandleInner::DirectRead { reader, .. }) => Ok(reader.len()),
            _ => Err(CacheError::InvalidHandle),
        }
    }

    pub fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len()? == 0)
    }

    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, CacheError> {
        Ok(self.writer()?.write(buf).await?)
    }

    pub async fn flush(&mut self) -> Result<(), CacheError> {
        match &mut self.inner {
            Some(HandleInner::CachedRead { .. }) | Some(HandleInner::DirectRead { .. }) => Ok(()),
            Some(HandleInner::DirectWrite { writer, .. }) => Ok(writer.flush().await?),
            Some(HandleInner::CreateFromSelect(cfs)) => Ok(cfs.writer.flush().await?),
            None => Err(CacheError::InvalidHandle),
        }
    }

    /// Releases the pin or lease; for a CREATE_FROM_SELECT writer this is
    /// where the local output is committed, admitted into the cache and
    /// uploaded into its registered remote sink. Returns bytes written (0
    /// for readers). A second close reports an invalid handle.
    pub async fn close(&mut self) -> Result<u64, CacheError> {
        match self.inner.take() {
            None => Err(CacheError::InvalidHandle),
            Some(HandleInner::CachedRead { .. }) | Some(HandleInner::DirectRead { .. }) => Ok(0),
            Some(HandleInner::DirectWrite { writer, _lease }) => Ok(writer.close().await?),
            Some(HandleInner::CreateFromSelect(cfs)) => close_create_from_select(*cfs).await,
        }
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        if let Some(HandleInner::CreateFromSelect(cfs)) = self.inner.take() {
            // dropped without close: the local output is incomplete and the
            // upload never happened
            warn!(path = %cfs.local_path, "create-from-select handle dropped without close");
            cfs.registry.unregister_create_from_select(&cfs.local_path);
            cfs.file.set_state(FileState::Failed {
                error: "writer dropped before close".to_owned(),
                retry_at: std::time::Instant::now(),
            });
        }
    }
}

async fn close_create_from_select(cfs: CfsWrite) -> Result<u64, CacheError> {
    let CfsWrite {
        registry,
        lease,
        writer,
        file,
        local_path,
        previous_size,
        options,
    } = cfs;

    let size = writer.close().await?;
    {
        use std::os::unix::fs::MetadataExt;
        if let Ok(meta) = std::fs::metadata(&local_path) {
            file.set_ino(meta.ino());
        }
    }
    file.set_state(FileState::Ready { size });
    let cache = registry
        .shared
        .cache
        .get()
        .ok_or(CacheError::InvalidHandle)?;
    cache.reconcile_admission(&file, size, previous_size);

    // the registration is consumed exactly once
    let Some(pair) = registry.unregister_create_from_select(&local_path) else {
        warn!(%local_path, "create-from-select registration already consumed");
        return Ok(size);
    };

    let local = remote_fs::LocalFs::new();
    let local_remote_path =
        RemotePath::new(&local_path).map_err(|e| CacheError::Config(e.to_string()))?;
    let mut source = local.open_read(&local_remote_path).await?;
    let mut sink = lease
        .fs()
        .create_write(&pair.remote_path, options.create_options())
        .await?;
    let mut buf = vec![0u8; options.buffer_size.max(64 * 1024)];
    loop {
        let n = source.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        sink.write(&buf[..n]).await?;
    }
    sink.close().await?;
    drop(lease);
    Ok(size)
}
