//! Tachyon adapter: a decorator over the HDFS-compatible endpoint the
//! tachyon master exposes.
//!
//! The one behavioral difference from the decorated filesystem is
//! open-for-read: the object is drained to EOF and the handle closed before
//! the real open, in that order, because closing a fully-read stream is
//! what commits the object into the server-side cache. The handle returned
//! to the caller is a fresh stream at offset zero.

use crate::{
    BlockLocation, CreateOptions, FilesystemDescriptor, FsError, FsObjectStatus, GenericRemoteFs,
    HdfsFs, RemoteFileSystem, RemotePath, RemoteReader, RemoteWriter,
};

/// Drain buffer size; bytes are discarded as they arrive.
pub const DRAIN_BUFFER_SIZE: usize = 6400 * 1024;

pub struct TachyonFs {
    inner: Box<GenericRemoteFs>,
}

impl TachyonFs {
    pub fn dial(descriptor: &FilesystemDescriptor) -> Result<Self, FsError> {
        let inner = GenericRemoteFs::Hdfs(std::sync::Arc::new(HdfsFs::dial(descriptor)?));
        Ok(TachyonFs {
            inner: Box::new(inner),
        })
    }

    /// Decorates an arbitrary inner adapter. The dial path always wraps the
    /// master's HDFS-compatible endpoint; this is for tests.
    pub fn over(inner: GenericRemoteFs) -> Self {
        TachyonFs {
            inner: Box::new(inner),
        }
    }

    /// Reads the object end to end and closes the stream, forcing the
    /// server to materialize it in its cache. Returns the number of bytes
    /// drained.
    pub(crate) async fn preheat(&self, path: &RemotePath) -> Result<u64, FsError> {
        let mut reader = self.inner.open_read(path).await?;
        let mut buf = vec![0u8; DRAIN_BUFFER_SIZE];
        let mut drained = 0u64;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            drained += n as u64;
        }
        // dropping the reader is the close that commits the cache
        drop(reader);
        Ok(drained)
    }
}

#[async_trait::async_trait]
impl RemoteFileSystem for TachyonFs {
    async fn exists(&self, path: &RemotePath) -> Result<bool, FsError> {
        self.inner.exists(path).await
    }

    async fn file_status(&self, path: &RemotePath) -> Result<FsObjectStatus, FsError> {
        self.inner.file_status(path).await
    }

    async fn list_status(&self, path: &RemotePath) -> Result<Vec<FsObjectStatus>, FsError> {
        self.inner.list_status(path).await
    }

    async fn block_locations(&self, path: &RemotePath) -> Result<Vec<BlockLocation>, FsError> {
        self.inner.block_locations(path).await
    }

    async fn open_read(&self, path: &RemotePath) -> Result<RemoteReader, FsError> {
        self.preheat(path).await?;
        // reopen with the original flags; the caller sees offset 0
        self.inner.open_read(path).await
    }

    async fn create_write(
        &self,
        path: &RemotePath,
        opts: CreateOptions,
    ) -> Result<RemoteWriter, FsError> {
        // writes bypass the drain
        self.inner.create_write(path, opts).await
    }

    async fn create_directory(&self, path: &RemotePath) -> Result<(), FsError> {
        self.inner.create_directory(path).await
    }

    async fn rename(&self, from: &RemotePath, to: &RemotePath) -> Result<(), FsError> {
        self.inner.rename(from, to).await
    }

    async fn delete(&self, path: &RemotePath, recursive: bool) -> Result<bool, FsError> {
        self.inner.delete(path, recursive).await
    }

    async fn copy(&self, from: &RemotePath, to: &RemotePath) -> Result<(), FsError> {
        self.inner.copy(from, to).await
    }

    async fn chown(
        &self,
        path: &RemotePath,
        owner: Option<&str>,
        group: Option<&str>,
    ) -> Result<(), FsError> {
        self.inner.chown(path, owner, group).await
    }

    async fn chmod(&self, path: &RemotePath, mode: u32) -> Result<(), FsError> {
        self.inner.chmod(path, mode).await
    }

    async fn set_replication(&self, path: &RemotePath, replication: u32) -> Result<bool, FsError> {
        self.inner.set_replication(path, replication).await
    }

    async fn get_used(&self) -> Result<u64, FsError> {
        self.inner.get_used().await
    }

    async fn get_capacity(&self) -> Result<u64, FsError> {
        self.inner.get_capacity().await
    }

    fn default_block_size(&self) -> u64 {
        self.inner.default_block_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LocalFs;
    use camino_tempfile::tempdir;

    #[tokio::test]
    async fn open_for_read_drains_then_reopens() {
        let dir = tempdir().unwrap();
        let payload = vec![7u8; 100_000];
        tokio::fs::write(dir.path().join("obj"), &payload).await.unwrap();

        let tachyon = TachyonFs::over(GenericRemoteFs::LocalFs(LocalFs::new_with_root(
            dir.path().to_path_buf(),
        )));
        let path = RemotePath::from_string("/obj").unwrap();

        // the drain reads at least the whole object
        let drained = tachyon.preheat(&path).await.unwrap();
        assert_eq!(drained, payload.len() as u64);

        // the returned handle is a fresh stream at offset 0
        let mut reader = tachyon.open_read(&path).await.unwrap();
        assert_eq!(reader.tell(), 0);
        assert_eq!(reader.len(), payload.len() as u64);
        let mut buf = vec![0u8; 16];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &payload[..n]);
    }

    #[tokio::test]
    async fn missing_object_fails_the_open() {
        let dir = tempdir().unwrap();
        let tachyon = TachyonFs::over(GenericRemoteFs::LocalFs(LocalFs::new_with_root(
            dir.path().to_path_buf(),
        )));
        let path = RemotePath::from_string("/gone").unwrap();
        assert!(matches!(
            tachyon.open_read(&path).await,
            Err(FsError::NotFound)
        ));
    }
}
