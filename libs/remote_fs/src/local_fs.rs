//! Local-filesystem adapter: serves descriptors with no host. Also the
//! workhorse of the test suite, where a scratch directory stands in for the
//! remote side.

use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::time::SystemTime;

use camino::Utf8PathBuf;

use crate::{
    BlockLocation, CreateOptions, FsError, FsObjectStatus, RemoteFileSystem, RemotePath,
    RemoteReader, RemoteWriter,
};

/// Reported block size of local files, matching what Hadoop's local
/// filesystem advertises.
const LOCAL_BLOCK_SIZE: u64 = 32 * 1024 * 1024;

#[derive(Clone)]
pub struct LocalFs {
    root: Utf8PathBuf,
}

impl LocalFs {
    /// Adapter over the real root. Remote paths are absolute paths.
    pub fn new() -> Self {
        LocalFs {
            root: Utf8PathBuf::from("/"),
        }
    }

    /// Adapter jailed under `root`; remote paths resolve relative to it.
    pub fn new_with_root(root: Utf8PathBuf) -> Self {
        LocalFs { root }
    }

    fn resolve(&self, path: &RemotePath) -> Utf8PathBuf {
        self.root.join(path.get_path())
    }

    async fn metadata(&self, path: &RemotePath) -> Result<std::fs::Metadata, FsError> {
        Ok(tokio::fs::metadata(self.resolve(path)).await?)
    }

    fn status_from_metadata(path: RemotePath, meta: &std::fs::Metadata) -> FsObjectStatus {
        FsObjectStatus {
            path,
            is_dir: meta.is_dir(),
            size: meta.len(),
            modified_at: meta.modified().ok(),
            owner: None,
            group: None,
            permission: Some(meta.permissions().mode() & 0o7777),
            block_size: LOCAL_BLOCK_SIZE,
        }
    }
}

impl Default for LocalFs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl RemoteFileSystem for LocalFs {
    async fn exists(&self, path: &RemotePath) -> Result<bool, FsError> {
        match tokio::fs::metadata(self.resolve(path)).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn file_status(&self, path: &RemotePath) -> Result<FsObjectStatus, FsError> {
        let meta = self.metadata(path).await?;
        Ok(Self::status_from_metadata(path.clone(), &meta))
    }

    async fn list_status(&self, path: &RemotePath) -> Result<Vec<FsObjectStatus>, FsError> {
        let mut entries = tokio::fs::read_dir(self.resolve(path)).await?;
        let mut statuses = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry
                .file_name()
                .into_string()
                .map_err(|bad| FsError::BadInput(format!("non-utf8 file name {bad:?}")))?;
            let meta = entry.metadata().await?;
            statuses.push(Self::status_from_metadata(path.join(&name), &meta));
        }
        Ok(statuses)
    }

    async fn block_locations(&self, path: &RemotePath) -> Result<Vec<BlockLocation>, FsError> {
        let meta = self.metadata(path).await?;
        Ok(vec![BlockLocation {
            offset: 0,
            length: meta.len(),
            hosts: vec!["localhost".to_owned()],
            disk_ids: vec![meta.dev()],
        }])
    }

    async fn open_read(&self, path: &RemotePath) -> Result<RemoteReader, FsError> {
        let file = tokio::fs::File::open(self.resolve(path)).await?;
        let len = file.metadata().await?.len();
        Ok(RemoteReader::new(crate::ReaderKind::Local(file), len))
    }

    async fn create_write(
        &self,
        path: &RemotePath,
        opts: CreateOptions,
    ) -> Result<RemoteWriter, FsError> {
        let target = self.resolve(path);
        if !opts.overwrite && tokio::fs::metadata(&target).await.is_ok() {
            return Err(FsError::BadInput(format!("{path} already exists")));
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::File::create(&target).await?;
        Ok(RemoteWriter::new(crate::WriterKind::Local(file)))
    }

    async fn create_directory(&self, path: &RemotePath) -> Result<(), FsError> {
        Ok(tokio::fs::create_dir_all(self.resolve(path)).await?)
    }

    async fn rename(&self, from: &RemotePath, to: &RemotePath) -> Result<(), FsError> {
        let target = self.resolve(to);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(tokio::fs::rename(self.resolve(from), target).await?)
    }

    async fn delete(&self, path: &RemotePath, recursive: bool) -> Result<bool, FsError> {
        let target = self.resolve(path);
        let meta = match tokio::fs::metadata(&target).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if meta.is_dir() {
            if recursive {
                tokio::fs::remove_dir_all(&target).await?;
            } else {
                tokio::fs::remove_dir(&target).await?;
            }
        } else {
            tokio::fs::remove_file(&target).await?;
        }
        Ok(true)
    }

    async fn copy(&self, from: &RemotePath, to: &RemotePath) -> Result<(), FsError> {
        let target = self.resolve(to);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(self.resolve(from), target).await?;
        Ok(())
    }

    async fn chown(
        &self,
        path: &RemotePath,
        owner: Option<&str>,
        group: Option<&str>,
    ) -> Result<(), FsError> {
        let uid = match owner {
            Some(name) => Some(
                nix::unistd::User::from_name(name)
                    .map_err(|e| FsError::Other(anyhow::anyhow!("user lookup failed: {e}")))?
                    .ok_or_else(|| FsError::BadInput(format!("unknown user {name:?}")))?
                    .uid,
            ),
            None => None,
        };
        let gid = match group {
            Some(name) => Some(
                nix::unistd::Group::from_name(name)
                    .map_err(|e| FsError::Other(anyhow::anyhow!("group lookup failed: {e}")))?
                    .ok_or_else(|| FsError::BadInput(format!("unknown group {name:?}")))?
                    .gid,
            ),
            None => None,
        };
        nix::unistd::chown(self.resolve(path).as_std_path(), uid, gid)
            .map_err(|e| FsError::Other(anyhow::anyhow!("chown failed: {e}")))
    }

    async fn chmod(&self, path: &RemotePath, mode: u32) -> Result<(), FsError> {
        Ok(tokio::fs::set_permissions(
            self.resolve(path),
            std::fs::Permissions::from_mode(mode),
        )
        .await?)
    }

    async fn set_replication(&self, _path: &RemotePath, _replication: u32) -> Result<bool, FsError> {
        // The local filesystem has a fixed replication factor of one.
        Ok(false)
    }

    async fn get_used(&self) -> Result<u64, FsError> {
        let stat = self.statvfs()?;
        Ok(self.capacity_of(&stat) - stat.blocks_available() as u64 * stat.fragment_size() as u64)
    }

    async fn get_capacity(&self) -> Result<u64, FsError> {
        let stat = self.statvfs()?;
        Ok(self.capacity_of(&stat))
    }

    fn default_block_size(&self) -> u64 {
        LOCAL_BLOCK_SIZE
    }
}

impl LocalFs {
    fn statvfs(&self) -> Result<nix::sys::statvfs::Statvfs, FsError> {
        nix::sys::statvfs::statvfs(self.root.as_std_path())
            .map_err(|e| FsError::Other(anyhow::anyhow!("statvfs({}) failed: {e}", self.root)))
    }

    fn capacity_of(&self, stat: &nix::sys::statvfs::Statvfs) -> u64 {
        stat.blocks() as u64 * stat.fragment_size() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;

    #[tokio::test]
    async fn stat_list_and_read() {
        let dir = tempdir().unwrap();
        let fs = LocalFs::new_with_root(dir.path().to_path_buf());
        tokio::fs::create_dir_all(dir.path().join("d")).await.unwrap();
        tokio::fs::write(dir.path().join("d/f"), b"hello").await.unwrap();

        let f = RemotePath::from_string("/d/f").unwrap();
        let status = fs.file_status(&f).await.unwrap();
        assert_eq!(status.size, 5);
        assert!(!status.is_dir);

        let listing = fs
            .list_status(&RemotePath::from_string("/d").unwrap())
            .await
            .unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].path, f);

        let mut reader = fs.open_read(&f).await.unwrap();
        let mut buf = [0u8; 16];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");

        // positioned read does not move the cursor
        let n = reader.read_at(1, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ello");
        assert_eq!(reader.tell(), 5);
    }

    #[tokio::test]
    async fn write_then_rename() {
        let dir = tempdir().unwrap();
        let fs = LocalFs::new_with_root(dir.path().to_path_buf());

        let tmp = RemotePath::from_string("/out/part.tmp").unwrap();
        let mut writer = fs
            .create_write(&tmp, CreateOptions { overwrite: true, ..Default::default() })
            .await
            .unwrap();
        writer.write(b"abc").await.unwrap();
        assert_eq!(writer.close().await.unwrap(), 3);

        let finished = RemotePath::from_string("/out/part").unwrap();
        fs.rename(&tmp, &finished).await.unwrap();
        assert!(!fs.exists(&tmp).await.unwrap());
        assert_eq!(fs.file_status(&finished).await.unwrap().size, 3);

        assert!(fs.delete(&finished, false).await.unwrap());
        assert!(!fs.delete(&finished, false).await.unwrap());
    }
}
